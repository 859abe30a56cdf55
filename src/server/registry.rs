//! Stream registry.
//!
//! The single source of truth for which streams are running. Every
//! operation takes the lock once, so no caller can observe a half-applied
//! change. The lock is never held across an `.await`.

use super::stream::{StreamHandle, StreamIdentity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Returned by [`StreamRegistry::insert`] when the identity is already taken.
///
/// Carries the rejected handle so the caller can release it.
#[derive(Debug, Error)]
#[error("stream already active: {}", .rejected.identity())]
pub struct AlreadyActive {
    pub rejected: Arc<StreamHandle>,
}

/// A registry entry that has been taken out of the registry.
#[derive(Debug)]
pub struct Removed {
    pub handle: Arc<StreamHandle>,
    /// The stream's pipeline task, if one was attached.
    pub task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Entry {
    handle: Arc<StreamHandle>,
    task: Option<JoinHandle<()>>,
}

/// Concurrency-safe map from stream identity to the active stream.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    entries: Mutex<HashMap<StreamIdentity, Entry>>,
}

impl StreamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<StreamIdentity, Entry>> {
        // Entries stay consistent even if a holder panicked; each
        // operation is a single map call.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stream. Fails if its identity is already active.
    pub fn insert(&self, handle: Arc<StreamHandle>) -> Result<(), AlreadyActive> {
        let mut entries = self.entries();
        if entries.contains_key(handle.identity()) {
            return Err(AlreadyActive { rejected: handle });
        }
        entries.insert(handle.identity().clone(), Entry { handle, task: None });
        Ok(())
    }

    /// Attach the pipeline task to the entry for `generation`.
    ///
    /// If that entry is already gone (stopped or ended before the task could
    /// be attached) the task is handed back.
    pub fn attach_task(
        &self,
        identity: &StreamIdentity,
        generation: u64,
        task: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let mut entries = self.entries();
        match entries.get_mut(identity) {
            Some(entry) if entry.handle.generation() == generation => {
                entry.task = Some(task);
                Ok(())
            }
            _ => Err(task),
        }
    }

    /// Look up the active stream for `identity`.
    #[must_use]
    pub fn lookup(&self, identity: &StreamIdentity) -> Option<Arc<StreamHandle>> {
        self.entries()
            .get(identity)
            .map(|entry| Arc::clone(&entry.handle))
    }

    /// Remove the active stream for `identity`, whichever it is. No-op if absent.
    pub fn remove(&self, identity: &StreamIdentity) -> Option<Removed> {
        self.entries().remove(identity).map(|entry| Removed {
            handle: entry.handle,
            task: entry.task,
        })
    }

    /// Remove the entry for `identity` only if it is still `generation`.
    ///
    /// A pipeline uses this to deregister itself without touching a newer
    /// stream started for the same identity. Returns whether anything was
    /// removed. The task handle of the removed entry is dropped, since the
    /// caller is that task.
    pub fn remove_generation(&self, identity: &StreamIdentity, generation: u64) -> bool {
        let mut entries = self.entries();
        let current = entries
            .get(identity)
            .is_some_and(|entry| entry.handle.generation() == generation);
        if current {
            entries.remove(identity);
        }
        current
    }

    /// Whether `identity` is active.
    #[must_use]
    pub fn contains(&self, identity: &StreamIdentity) -> bool {
        self.entries().contains_key(identity)
    }

    /// Snapshot of all active streams.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<StreamHandle>> {
        self.entries()
            .values()
            .map(|entry| Arc::clone(&entry.handle))
            .collect()
    }

    /// Take every entry out of the registry.
    pub fn drain(&self) -> Vec<Removed> {
        self.entries()
            .drain()
            .map(|(_, entry)| Removed {
                handle: entry.handle,
                task: entry.task,
            })
            .collect()
    }

    /// Number of registered entries whose pipeline task is still running.
    #[must_use]
    pub fn running_tasks(&self) -> usize {
        self.entries()
            .values()
            .filter(|entry| entry.task.as_ref().is_some_and(|task| !task.is_finished()))
            .count()
    }

    /// Number of active streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no stream is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
