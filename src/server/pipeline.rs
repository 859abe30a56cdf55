//! Tail pipeline: one task per active stream.

use super::broadcast::BroadcastHub;
use super::registry::StreamRegistry;
use super::stream::{StreamHandle, StreamIdentity};
use crate::protocol::{ChunkDecoder, LogMessage, PushMessage, unix_seconds};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

/// Pumps one remote stream into the broadcast hub until it ends.
pub struct TailPipeline {
    handle: Arc<StreamHandle>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    registry: Arc<StreamRegistry>,
    hub: BroadcastHub,
    chunk_size: usize,
}

impl TailPipeline {
    #[must_use]
    pub fn new(
        handle: Arc<StreamHandle>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        registry: Arc<StreamRegistry>,
        hub: BroadcastHub,
        chunk_size: usize,
    ) -> Self {
        Self {
            handle,
            reader,
            registry,
            hub,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Read until end of stream or error, then release and deregister.
    ///
    /// Closing the handle from elsewhere ends the pending read, which is how
    /// a stop reaches this loop.
    pub async fn run(mut self) {
        let identity = self.handle.identity().clone();
        let generation = self.handle.generation();
        let mut decoder = ChunkDecoder::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut bytes = 0usize;

        debug!(%identity, generation, "tail pipeline started");

        loop {
            match self.reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(%identity, generation, "stream reached end");
                    break;
                }
                Ok(n) => {
                    bytes += n;
                    let content = decoder.decode(&buf[..n]);
                    emit(&self.hub, &identity, content).await;
                }
                Err(e) => {
                    debug!(%identity, generation, %e, "stream read failed");
                    break;
                }
            }
        }

        if let Some(rest) = decoder.finish() {
            emit(&self.hub, &identity, rest).await;
        }

        self.handle.close();
        let deregistered = self.registry.remove_generation(&identity, generation);
        info!(%identity, generation, bytes, deregistered, "tail stream ended");
    }
}

async fn emit(hub: &BroadcastHub, identity: &StreamIdentity, content: String) {
    if content.is_empty() {
        return;
    }
    let message = PushMessage::Log(LogMessage {
        server: identity.server.clone(),
        file: identity.file.clone(),
        content,
        timestamp: unix_seconds(),
    });
    hub.publish(&message).await;
}
