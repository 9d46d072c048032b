//! Ephemeral HTTP server exposing one answer file to the installer.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ScratchError;

/// A running answer-file server. The listening socket is released by
/// [`AnswerServer::shutdown`], or on drop if shutdown was never called.
pub struct AnswerServer {
    addr: SocketAddr,
    file_name: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AnswerServer {
    /// Bind `bind` and serve `contents` at `/<file_name>`.
    pub async fn start(
        bind: SocketAddr,
        file_name: &str,
        contents: String,
    ) -> Result<Self, ScratchError> {
        let route = format!("/{file_name}");
        let app = Router::new().route(
            &route,
            get(move || {
                let body = contents.clone();
                async move {
                    tracing::info!("answer file fetched");
                    body
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .map_err(|e| ScratchError::Io {
                context: format!("binding answer-file server on {bind}"),
                source: e,
            })?;
        let addr = listener.local_addr().map_err(|e| ScratchError::Io {
            context: "reading answer-file server address".into(),
            source: e,
        })?;

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = rx.await;
            });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "answer-file server error");
            }
            tracing::debug!("answer-file server stopped");
        });

        tracing::info!(%addr, path = %route, "answer-file server listening");
        Ok(Self {
            addr,
            file_name: file_name.to_string(),
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL of the file as reachable from the guest via `host`.
    pub fn url(&self, host: &str) -> String {
        format!("http://{host}:{}/{}", self.addr.port(), self.file_name)
    }

    /// Stop serving and wait for the socket to close. Safe to call twice.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            // a guest holding a connection open must not stall teardown
            if tokio::time::timeout(std::time::Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
                let _ = task.await;
            }
            tracing::info!(addr = %self.addr, "answer-file server shut down");
        }
    }
}

impl Drop for AnswerServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
