use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::install::answer_server::AnswerServer;

#[derive(Default)]
struct Resources {
    server: Option<AnswerServer>,
    files: Vec<PathBuf>,
}

/// Scoped resources owned by a running workflow.
///
/// Clones share the same resources, so the signal handler in `main` can
/// hold one while the workflow holds another. [`Cleanup::run`] may be
/// called any number of times.
#[derive(Clone, Default)]
pub struct Cleanup {
    inner: Arc<Mutex<Resources>>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_server(&self, server: AnswerServer) {
        let mut inner = self.inner.lock().unwrap();
        inner.server = Some(server);
    }

    pub fn register_file(&self, path: PathBuf) {
        self.inner.lock().unwrap().files.push(path);
    }

    pub fn has_server(&self) -> bool {
        self.inner.lock().unwrap().server.is_some()
    }

    /// Shut the file server down now, ahead of the final cleanup.
    pub async fn release_server(&self) {
        let server = self.inner.lock().unwrap().server.take();
        if let Some(mut server) = server {
            server.shutdown().await;
        }
    }

    /// Stop the file server and remove temporary files. Already-released
    /// resources and already-deleted files are not errors.
    pub async fn run(&self) {
        self.release_server().await;

        let files = std::mem::take(&mut self.inner.lock().unwrap().files);
        for path in files {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed temporary file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary file")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    #[tokio::test]
    async fn running_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ci.answers");
        std::fs::write(&file, "x").unwrap();

        let server = AnswerServer::start(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), "ci.answers", "x".into())
            .await
            .unwrap();
        let addr = server.local_addr();

        let cleanup = Cleanup::new();
        cleanup.register_server(server);
        cleanup.register_file(file.clone());

        let handle = cleanup.clone();
        cleanup.run().await;
        handle.run().await;

        assert!(!file.exists());
        assert!(!cleanup.has_server());
        tokio::net::TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn externally_removed_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gone");
        let cleanup = Cleanup::new();
        cleanup.register_file(file);
        cleanup.run().await;
    }
}
