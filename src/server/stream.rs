//! Stream identity and handle.

use crate::protocol::{StreamInfo, unix_seconds};
use crate::remote::StreamCloser;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Names one live tailing operation: a server and one of its file aliases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamIdentity {
    pub server: String,
    pub file: String,
}

impl StreamIdentity {
    #[must_use]
    pub fn new(server: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            file: file.into(),
        }
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server, self.file)
    }
}

/// An active tail stream.
///
/// The handle owns the release capability of the remote stream. The reader
/// itself is owned by the stream's pipeline task.
pub struct StreamHandle {
    identity: StreamIdentity,
    /// Distinguishes this stream from earlier or later ones with the same identity.
    generation: u64,
    /// Unix timestamp (seconds) when the stream was registered.
    started_at: u64,
    closer: Box<dyn StreamCloser>,
    closed: AtomicBool,
}

impl StreamHandle {
    #[must_use]
    pub fn new(identity: StreamIdentity, generation: u64, closer: Box<dyn StreamCloser>) -> Self {
        Self {
            identity,
            generation,
            started_at: unix_seconds(),
            closer,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn started_at(&self) -> u64 {
        self.started_at
    }

    /// Release the remote stream.
    ///
    /// Only the first call reaches the underlying closer. Returns whether
    /// this call was the one that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.closer.close();
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            server: self.identity.server.clone(),
            file: self.identity.file.clone(),
            started_at: self.started_at,
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("identity", &self.identity)
            .field("generation", &self.generation)
            .field("started_at", &self.started_at)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
