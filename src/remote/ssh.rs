use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};

use crate::error::ScratchError;

use super::{Auth, ExecOutput, RemoteTransport, Target};

/// Exit code reported when the remote side closes without an exit status
/// (killed by a signal), matching OpenSSH.
const NO_EXIT_STATUS: i32 = 255;

/// Minimal russh client handler: accepts all server keys (like
/// StrictHostKeyChecking=no). Guests are throwaway and re-keyed on every clone.
struct SshHandler;

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// SSH transport over russh.
#[derive(Debug, Clone)]
pub struct SshTransport {
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(
        &self,
        target: &Target,
        auth: &Auth,
    ) -> Result<client::Handle<SshHandler>, ScratchError> {
        let config = Arc::new(client::Config::default());
        let addr = format!("{}:{}", target.host, target.port);
        let unreachable = |message: String| ScratchError::ConnectivityFailure {
            target: target.to_string(),
            message,
        };

        let mut handle =
            match tokio::time::timeout(self.connect_timeout, client::connect(config, &*addr, SshHandler))
                .await
            {
                Ok(Ok(h)) => h,
                Ok(Err(e)) => return Err(unreachable(e.to_string())),
                Err(_) => {
                    return Err(unreachable(format!(
                        "no SSH handshake within {}s",
                        self.connect_timeout.as_secs()
                    )));
                }
            };

        let result = match auth {
            Auth::Key(path) => {
                let key_data = std::fs::read_to_string(path).map_err(|e| ScratchError::Io {
                    context: format!("reading SSH key {}", path.display()),
                    source: e,
                })?;
                let key = keys::decode_secret_key(&key_data, None).map_err(|e| {
                    ScratchError::Ssh {
                        message: format!("failed to decode {}: {e}", path.display()),
                    }
                })?;
                let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&target.user, key_with_alg)
                    .await
            }
            Auth::Password(password) => {
                handle
                    .authenticate_password(&target.user, password)
                    .await
            }
        }
        .map_err(|e| unreachable(format!("authentication failed: {e}")))?;

        if !result.success() {
            return Err(unreachable(format!(
                "authentication rejected for user {}",
                target.user
            )));
        }

        Ok(handle)
    }
}

impl RemoteTransport for SshTransport {
    async fn exec(
        &self,
        target: &Target,
        auth: &Auth,
        script: &str,
    ) -> Result<ExecOutput, ScratchError> {
        let handle = self.connect(target, auth).await?;
        tracing::debug!(%target, "ssh exec");

        let ssh_err = |e: russh::Error| ScratchError::Ssh {
            message: e.to_string(),
        };
        let mut channel = handle.channel_open_session().await.map_err(ssh_err)?;
        channel.exec(true, script).await.map_err(ssh_err)?;

        let mut output = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                _ => {}
            }
        }

        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        Ok(ExecOutput {
            exit_code: exit_code.unwrap_or(NO_EXIT_STATUS),
            output: String::from_utf8_lossy(&output).into_owned(),
        })
    }
}
