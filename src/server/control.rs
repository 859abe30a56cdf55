//! Start, stop and execute: the operations that drive stream lifecycles.

use super::broadcast::BroadcastHub;
use super::pipeline::TailPipeline;
use super::registry::StreamRegistry;
use super::stream::{StreamHandle, StreamIdentity};
use crate::config::{Config, ServerProfile};
use crate::protocol::StreamInfo;
use crate::remote::{Connector, RemoteChannel, RemoteError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors returned by [`ControlSurface`] operations.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("log file not found: {file} on {server}")]
    FileNotFound { server: String, file: String },

    #[error("failed to open stream on {server}: {source}")]
    Connection {
        server: String,
        #[source]
        source: RemoteError,
    },

    #[error("command failed on {server}: {source}")]
    Execution {
        server: String,
        #[source]
        source: RemoteError,
    },

    #[error("stream already active: {0}")]
    Conflict(StreamIdentity),
}

impl ControlError {
    /// Whether the error names something that is not configured.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ServerNotFound(_) | Self::FileNotFound { .. })
    }
}

/// Orchestrates remote channels, the registry and tail pipelines.
///
/// Re-starting an identity that is already active is rejected with
/// [`ControlError::Conflict`]; the existing stream keeps running.
pub struct ControlSurface {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    registry: Arc<StreamRegistry>,
    hub: BroadcastHub,
    next_generation: AtomicU64,
    /// Pipelines of stopped streams that may still be winding down.
    retiring: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlSurface {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        registry: Arc<StreamRegistry>,
        hub: BroadcastHub,
    ) -> Self {
        Self {
            config,
            connector,
            registry,
            hub,
            next_generation: AtomicU64::new(1),
            retiring: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    fn profile(&self, server: &str) -> Result<&ServerProfile, ControlError> {
        self.config
            .server(server)
            .ok_or_else(|| ControlError::ServerNotFound(server.to_string()))
    }

    async fn connect(
        &self,
        profile: &ServerProfile,
    ) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        let timeout = self.config.stream.connect_timeout();
        match tokio::time::timeout(timeout, self.connector.connect(profile)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(format!(
                "{}:{}",
                profile.host, profile.port
            ))),
        }
    }

    /// Start tailing `file` on `server`, replaying the last `lines` lines.
    ///
    /// Returns once the pipeline task is running; log content arrives on the
    /// broadcast hub.
    pub async fn start(&self, server: &str, file: &str, lines: u32) -> Result<(), ControlError> {
        let profile = self.profile(server)?;
        let spec = profile
            .log_file(file)
            .ok_or_else(|| ControlError::FileNotFound {
                server: server.to_string(),
                file: file.to_string(),
            })?;
        let identity = StreamIdentity::new(server, file);

        let connection_error = |source| ControlError::Connection {
            server: server.to_string(),
            source,
        };
        let channel = self.connect(profile).await.map_err(connection_error)?;
        let tail = channel
            .open_tail(&spec.path, lines)
            .await
            .map_err(connection_error)?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(StreamHandle::new(identity.clone(), generation, tail.closer));

        if let Err(conflict) = self.registry.insert(Arc::clone(&handle)) {
            // The rejected attempt is not tracked anywhere; release it now.
            conflict.rejected.close();
            warn!(%identity, "stream already active, rejected start");
            return Err(ControlError::Conflict(identity));
        }

        let pipeline = TailPipeline::new(
            handle,
            tail.reader,
            Arc::clone(&self.registry),
            self.hub.clone(),
            self.config.stream.chunk_size,
        );
        let task = tokio::spawn(pipeline.run());
        if let Err(task) = self.registry.attach_task(&identity, generation, task) {
            // Stopped or ended before we got here; let it finish on its own.
            self.retire(task);
        }

        info!(%identity, generation, lines, path = %spec.path, "stream started");
        Ok(())
    }

    /// Stop the stream for `file` on `server`. Stopping an inactive stream is a no-op.
    pub fn stop(&self, server: &str, file: &str) {
        let identity = StreamIdentity::new(server, file);
        match self.registry.remove(&identity) {
            Some(removed) => {
                removed.handle.close();
                if let Some(task) = removed.task {
                    self.retire(task);
                }
                info!(%identity, generation = removed.handle.generation(), "stream stopped");
            }
            None => debug!(%identity, "stop requested for inactive stream"),
        }
    }

    /// Run `command` on `server` over a fresh channel and return its output.
    pub async fn execute(&self, server: &str, command: &str) -> Result<String, ControlError> {
        let profile = self.profile(server)?;
        let mut channel = self
            .connect(profile)
            .await
            .map_err(|source| ControlError::Connection {
                server: server.to_string(),
                source,
            })?;

        let result = channel.execute(command).await;
        channel.close();

        match result {
            Ok(output) => {
                debug!(%server, bytes = output.len(), "command completed");
                Ok(output)
            }
            Err(source) => {
                warn!(%server, %source, "command failed");
                Err(ControlError::Execution {
                    server: server.to_string(),
                    source,
                })
            }
        }
    }

    /// Active streams, sorted by server then file.
    #[must_use]
    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut handles = self.registry.list();
        handles.sort_by(|a, b| a.identity().cmp(b.identity()));
        handles.iter().map(|h| h.info()).collect()
    }

    /// Number of pipeline tasks still running, registered or retiring.
    #[must_use]
    pub fn live_pipelines(&self) -> usize {
        let retiring = self
            .retiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|task| !task.is_finished())
            .count();
        self.registry.running_tasks() + retiring
    }

    /// Close every stream and wait for all pipelines to finish.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(
            &mut *self
                .retiring
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let removed = self.registry.drain();
        let count = removed.len();
        for entry in removed {
            entry.handle.close();
            tasks.extend(entry.task);
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!(%e, "tail pipeline panicked");
            }
        }
        info!(streams = count, "all streams shut down");
    }

    fn retire(&self, task: JoinHandle<()>) {
        let mut retiring = self.retiring.lock().unwrap_or_else(PoisonError::into_inner);
        retiring.retain(|t| !t.is_finished());
        retiring.push(task);
    }
}
