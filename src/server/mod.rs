//! The logview server.
//!
//! Owns the stream registry, the broadcast hub and every tail pipeline.
//! Serves the HTTP API and the viewer WebSocket.

mod broadcast;
mod control;
mod http;
mod pipeline;
mod registry;
mod stream;

pub use broadcast::{BroadcastHub, Frame, Subscription};
pub use control::{ControlError, ControlSurface};
pub use http::{HttpError, router};
pub use pipeline::TailPipeline;
pub use registry::{AlreadyActive, Removed, StreamRegistry};
pub use stream::{StreamHandle, StreamIdentity};

use crate::config::Config;
use crate::remote::Connector;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// The logview server.
pub struct Server {
    control: Arc<ControlSurface>,
    static_dir: Option<PathBuf>,
}

impl Server {
    /// Create a server for `config`, reaching hosts through `connector`.
    #[must_use]
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let config = Arc::new(config);
        let hub = BroadcastHub::new(config.broadcast);
        let control = ControlSurface::new(
            Arc::clone(&config),
            connector,
            Arc::new(StreamRegistry::new()),
            hub,
        );
        Self {
            control: Arc::new(control),
            static_dir: None,
        }
    }

    /// Serve files from `dir` for any path the API does not handle.
    #[must_use]
    pub fn with_static_dir(mut self, dir: PathBuf) -> Self {
        self.static_dir = Some(dir);
        self
    }

    #[must_use]
    pub const fn control(&self) -> &Arc<ControlSurface> {
        &self.control
    }

    /// Bind `addr` and serve until Ctrl-C or SIGTERM.
    pub async fn run(self, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// On shutdown every stream is closed and every pipeline awaited before
    /// this returns.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().map_err(ServerError::Io)?;
        info!("Server listening on {addr}");

        let app = router(Arc::clone(&self.control), self.static_dir.as_deref());
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(ServerError::Io)?;

        self.control.shutdown().await;
        self.control.hub().disconnect_all();
        info!("Server shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(%e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(%e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received");
}
