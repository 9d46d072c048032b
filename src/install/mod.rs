//! Unattended install driver: answer-file server, serial console, and the
//! scripted installer transcript.

pub mod answer_server;
pub mod answerfile;
pub mod console;
pub mod media;
pub mod transcript;

use crate::error::ScratchError;

use console::ConsoleConnector;
use transcript::Transcript;

/// Attach to the serial console and drive `transcript` to its last step.
/// The console connection is closed when this returns, on every path.
pub async fn run_install<C: ConsoleConnector>(
    connector: &C,
    transcript: &Transcript,
) -> Result<(), ScratchError> {
    let mut console = connector.connect().await?;
    tracing::info!(steps = transcript.steps().len(), "driving installer");
    let matched = transcript.drive(&mut console).await?;
    tracing::info!(steps = matched.len(), "unattended install finished");
    Ok(())
}
