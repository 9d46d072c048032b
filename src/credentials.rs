use std::path::{Path, PathBuf};

use ssh_key::PublicKey;

use crate::error::ScratchError;

/// An SSH key pair on the host: the private half for sessions, the public
/// half for injection into guests.
#[derive(Debug, Clone)]
pub struct SshCredential {
    pub private_key: PathBuf,
    public_key: PublicKey,
}

impl SshCredential {
    /// Load `<dir>/<name>` and `<dir>/<name>.pub`. Both must exist and the
    /// public half must parse as an OpenSSH key.
    pub fn load(dir: &Path, name: &str) -> Result<Self, ScratchError> {
        let private_key = dir.join(name);
        let public_path = dir.join(format!("{name}.pub"));

        if !private_key.exists() {
            return Err(ScratchError::PrerequisiteMissing {
                what: format!("SSH private key {}", private_key.display()),
                hint: format!("generate one with `ssh-keygen -t ed25519 -f {}`", private_key.display()),
            });
        }

        let public_key = PublicKey::read_openssh_file(&public_path).map_err(|e| {
            ScratchError::PrerequisiteMissing {
                what: format!("SSH public key {}", public_path.display()),
                hint: format!("could not read an OpenSSH public key: {e}"),
            }
        })?;

        tracing::debug!(
            key = %private_key.display(),
            algorithm = %public_key.algorithm(),
            "loaded SSH credential"
        );
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// The public key as a single authorized_keys line.
    pub fn public_openssh(&self) -> Result<String, ScratchError> {
        self.public_key
            .to_openssh()
            .map_err(|e| ScratchError::Ssh {
                message: format!("encoding public key: {e}"),
            })
    }
}
