use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ScratchError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("missing prerequisite: {what}")]
    PrerequisiteMissing {
        what: String,
        #[help]
        hint: String,
    },

    #[error("VM '{name}' already exists")]
    #[diagnostic(help("delete it first (`scratchvm destroy <name>`) or pass --force"))]
    AlreadyExists { name: String },

    #[error("VM '{name}' not found")]
    NotFound { name: String },

    #[error("cannot connect to {target}: {message}")]
    ConnectivityFailure { target: String, message: String },

    #[error(
        "installer transcript stalled at step '{step}': expected /{pattern}/ within {timeout_s}s\n\
         last console output:\n{tail}"
    )]
    #[diagnostic(help("the VM is in an indeterminate state; destroy it and rerun"))]
    InstallTranscriptMismatch {
        step: String,
        pattern: String,
        timeout_s: u64,
        /// Last bytes seen on the console before giving up.
        tail: String,
    },

    #[error("timed out {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("download failed: {message}")]
    Download {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("ssh error: {message}")]
    Ssh { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl ScratchError {
    /// Process exit code for this error: 1 for validation and prerequisite
    /// failures, 2 for install, connectivity and other runtime failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            ScratchError::ConfigLoad { .. }
            | ScratchError::ConfigParse { .. }
            | ScratchError::Validation { .. }
            | ScratchError::PrerequisiteMissing { .. }
            | ScratchError::AlreadyExists { .. }
            | ScratchError::NotFound { .. }
            | ScratchError::Cancelled => 1,
            _ => 2,
        }
    }
}
