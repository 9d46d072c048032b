//! Host-side process execution.
//!
//! Every external tool (`utmctl`, `osascript`, `PlistBuddy`, `arp`, `open`)
//! is reached through [`CommandRunner`] so the control plane can be driven
//! against canned output in tests.

use std::path::Path;

use crate::error::ScratchError;

/// Captured result of a host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into `ExternalCommand`.
    pub fn check(self, command: &str) -> Result<Self, ScratchError> {
        if self.success() {
            Ok(self)
        } else {
            let message = if self.stderr.trim().is_empty() {
                format!("exit status {}", self.status)
            } else {
                self.stderr.trim().to_string()
            };
            Err(ScratchError::ExternalCommand {
                command: command.to_string(),
                message,
            })
        }
    }
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait CommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ScratchError>;
}

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ScratchError> {
        tracing::debug!(program, ?args, "running host command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ScratchError::PrerequisiteMissing {
                        what: format!("`{program}`"),
                        hint: "install it or fix its path in scratchvm.toml".into(),
                    }
                } else {
                    ScratchError::Io {
                        context: format!("running {program}"),
                        source: e,
                    }
                }
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Whether `program` resolves to an existing file, either as a path or via `$PATH`.
pub fn program_exists(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_maps_failure_to_external_command() {
        let err = CommandOutput::failed(3, "boom\n").check("utmctl start").unwrap_err();
        match err {
            ScratchError::ExternalCommand { command, message } => {
                assert_eq!(command, "utmctl start");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn check_without_stderr_reports_status() {
        let err = CommandOutput::failed(7, "").check("arp").unwrap_err();
        assert!(err.to_string().contains("exit status 7"));
    }

    #[test]
    fn program_lookup() {
        assert!(!program_exists("/definitely/not/here/utmctl"));
        assert!(!program_exists("scratchvm-no-such-tool-xyz"));
    }

    #[tokio::test]
    async fn missing_program_is_a_prerequisite_error() {
        let err = ProcessRunner
            .run("scratchvm-no-such-tool-xyz", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ScratchError::PrerequisiteMissing { .. }));
    }
}
