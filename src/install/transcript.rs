//! Expect-style driver for the serial-console install transcript.
//!
//! A transcript is a list of [`Step`]s, each `(pattern, response, timeout)`.
//! The driver is a small state machine: it waits for the current step's
//! pattern, writes the response, and advances. A pattern that does not show
//! up before its deadline (or a console that closes) ends the install with
//! `InstallTranscriptMismatch`; there is no partial retry.

use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::ScratchError;

/// Console output kept for matching and error reports.
const MAX_BUFFER: usize = 64 * 1024;
const TAIL_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub expect: Regex,
    pub send: Option<String>,
    pub timeout: Duration,
}

impl Step {
    pub fn new(
        name: &str,
        pattern: &str,
        send: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ScratchError> {
        let expect = Regex::new(pattern).map_err(|e| ScratchError::Validation {
            message: format!("transcript step '{name}' has a bad pattern: {e}"),
        })?;
        Ok(Self {
            name: name.to_string(),
            expect,
            send,
            timeout,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Expecting(usize),
    Done,
}

#[derive(Debug, Clone)]
pub struct Transcript {
    steps: Vec<Step>,
}

impl Transcript {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Drive `console` through every step. Returns the names of the steps
    /// matched, in order.
    pub async fn drive<S>(&self, console: &mut S) -> Result<Vec<String>, ScratchError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buffer = String::new();
        let mut matched = Vec::with_capacity(self.steps.len());
        let mut chunk = [0u8; 4096];
        let mut state = if self.steps.is_empty() {
            State::Done
        } else {
            State::Expecting(0)
        };
        let mut deadline =
            Instant::now() + self.steps.first().map_or(Duration::ZERO, |s| s.timeout);

        while let State::Expecting(index) = state {
            let step = &self.steps[index];

            if let Some(found) = step.expect.find(&buffer) {
                tracing::info!(step = %step.name, "installer prompt matched");
                buffer.drain(..found.end());

                if let Some(response) = &step.send {
                    write_line(console, response).await?;
                }
                matched.push(step.name.clone());

                state = if index + 1 < self.steps.len() {
                    deadline = Instant::now() + self.steps[index + 1].timeout;
                    State::Expecting(index + 1)
                } else {
                    State::Done
                };
                continue;
            }

            let read = tokio::time::timeout_at(deadline, console.read(&mut chunk)).await;
            match read {
                Ok(Ok(0)) => {
                    tracing::warn!(step = %step.name, "console closed");
                    return Err(mismatch(step, &buffer));
                }
                Ok(Ok(n)) => {
                    let text = String::from_utf8_lossy(&chunk[..n]);
                    tracing::debug!(step = %step.name, output = %text.trim_end(), "console");
                    buffer.push_str(&text);
                    if buffer.len() > MAX_BUFFER {
                        let mut cut = buffer.len() - MAX_BUFFER;
                        while !buffer.is_char_boundary(cut) {
                            cut += 1;
                        }
                        buffer.drain(..cut);
                    }
                }
                Ok(Err(e)) => {
                    return Err(ScratchError::Io {
                        context: format!("reading serial console at step '{}'", step.name),
                        source: e,
                    });
                }
                Err(_) => {
                    tracing::warn!(step = %step.name, "installer prompt not seen before deadline");
                    return Err(mismatch(step, &buffer));
                }
            }
        }

        Ok(matched)
    }
}

async fn write_line<S: AsyncWrite + Unpin>(console: &mut S, line: &str) -> Result<(), ScratchError> {
    let io = |source| ScratchError::Io {
        context: "writing to serial console".into(),
        source,
    };
    console.write_all(line.as_bytes()).await.map_err(io)?;
    console.write_all(b"\n").await.map_err(io)?;
    console.flush().await.map_err(io)
}

fn mismatch(step: &Step, buffer: &str) -> ScratchError {
    let start = buffer
        .char_indices()
        .rev()
        .nth(TAIL_CHARS.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    ScratchError::InstallTranscriptMismatch {
        step: step.name.clone(),
        pattern: step.expect.as_str().to_string(),
        timeout_s: step.timeout.as_secs(),
        tail: buffer[start..].to_string(),
    }
}

/// Parameters of the Alpine `setup-alpine` transcript.
#[derive(Debug, Clone)]
pub struct AlpineTranscript {
    pub answer_url: String,
    pub root_password: String,
    pub prompt_timeout: Duration,
    pub completion_timeout: Duration,
}

/// Sentinel echoed after post-install tweaks. The shell expands the
/// arithmetic, so the echoed command line itself never matches.
const DONE_MARKER_CMD: &str = "echo SCRATCHVM_$((40+2))";
const DONE_MARKER: &str = "SCRATCHVM_42";

impl AlpineTranscript {
    pub fn build(&self) -> Result<Transcript, ScratchError> {
        let prompt = self.prompt_timeout;
        let fetch_and_setup = format!(
            "wget -q -O /tmp/answers {url} && setup-alpine -f /tmp/answers",
            url = self.answer_url
        );
        // sys install lands the root filesystem on the third partition
        let enable_root_login = format!(
            "mount /dev/vda3 /mnt && \
             echo 'PermitRootLogin yes' >> /mnt/etc/ssh/sshd_config && \
             umount /mnt && {DONE_MARKER_CMD}"
        );

        Ok(Transcript::new(vec![
            Step::new("login", r"login:", Some("root".into()), prompt)?,
            Step::new("live-shell", r":~# ?", Some(fetch_and_setup), prompt)?,
            Step::new(
                "root-password",
                r"New password:",
                Some(self.root_password.clone()),
                prompt,
            )?,
            Step::new(
                "root-password-confirm",
                r"Retype password:",
                Some(self.root_password.clone()),
                prompt,
            )?,
            Step::new("erase-disk", r"Erase the above disk", Some("y".into()), prompt)?,
            Step::new(
                "install-complete",
                r"Installation is complete",
                None,
                self.completion_timeout,
            )?,
            Step::new("post-install-shell", r":~# ?", Some(enable_root_login), prompt)?,
            Step::new("post-install-done", DONE_MARKER, Some("poweroff".into()), prompt)?,
        ]))
    }
}
