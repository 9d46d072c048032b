use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::RetryPolicy;
use crate::error::ScratchError;

/// Opens the VM's serial console as a byte stream.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait ConsoleConnector {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    async fn connect(&self) -> Result<Self::Stream, ScratchError>;
}

/// Serial console exposed by the hypervisor as a TCP server. The socket
/// only appears once the VM has started, so connecting is retried.
#[derive(Debug, Clone)]
pub struct TcpConsole {
    addr: SocketAddr,
    policy: RetryPolicy,
}

impl TcpConsole {
    pub fn new(addr: SocketAddr, policy: RetryPolicy) -> Self {
        Self { addr, policy }
    }
}

impl ConsoleConnector for TcpConsole {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream, ScratchError> {
        let mut last_error = String::new();
        for attempt in 1..=self.policy.attempts {
            match TcpStream::connect(self.addr).await {
                Ok(stream) => {
                    tracing::info!(addr = %self.addr, attempt, "serial console connected");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(addr = %self.addr, attempt, error = %e, "serial console not up yet");
                    last_error = e.to_string();
                }
            }
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }
        Err(ScratchError::ConnectivityFailure {
            target: format!("serial console {}", self.addr),
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn connects_to_a_listening_console() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let console = TcpConsole::new(
            listener.local_addr().unwrap(),
            RetryPolicy::new(3, Duration::ZERO),
        );
        let (connected, accepted) = tokio::join!(console.connect(), listener.accept());
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn gives_up_after_the_budget() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let console = TcpConsole::new(addr, RetryPolicy::new(2, Duration::ZERO));
        let err = console.connect().await.unwrap_err();
        assert!(matches!(err, ScratchError::ConnectivityFailure { .. }));
    }
}
