//! Remote bootstrap executor: SSH sessions into the guest.
//!
//! Every [`RemoteTransport::exec`] call is one independent authenticated
//! session; nothing is reused between steps.

pub mod bootstrap;
pub mod ssh;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::ScratchError;

/// How to authenticate a session.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Key(PathBuf),
    Password(String),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Key(path) => f.debug_tuple("Key").field(path).finish(),
            Auth::Password(_) => f.write_str("Password(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: Ipv4Addr,
    pub port: u16,
    pub user: String,
}

impl Target {
    pub fn new(host: Ipv4Addr, user: impl Into<String>) -> Self {
        Self {
            host,
            port: 22,
            user: user.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Exit status and interleaved stdout/stderr of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait RemoteTransport {
    /// Open a session, run `script` through the login shell, close.
    ///
    /// Connection and authentication problems are errors; a non-zero exit
    /// status is not.
    async fn exec(&self, target: &Target, auth: &Auth, script: &str)
    -> Result<ExecOutput, ScratchError>;
}
