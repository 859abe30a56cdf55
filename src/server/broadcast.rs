//! Fan-out of push messages to connected viewers.
//!
//! Each viewer gets its own bounded queue. What happens when a queue is full
//! depends on [`BackpressureMode`]: in `Drop` mode the viewer misses the
//! message, in `Block` mode the publisher waits up to the configured timeout
//! and then disconnects the viewer. Either way a publisher never waits
//! forever on a stuck viewer.

use crate::config::{BackpressureMode, BroadcastSettings};
use crate::protocol::PushMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tracing::{debug, warn};

/// A serialized push frame, shared by every viewer it is delivered to.
pub type Frame = Arc<str>;

struct Viewer {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

struct HubInner {
    settings: BroadcastSettings,
    viewers: Mutex<Vec<Viewer>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl HubInner {
    fn viewers(&self) -> MutexGuard<'_, Vec<Viewer>> {
        self.viewers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        self.viewers().retain(|v| !ids.contains(&v.id));
    }
}

/// Delivers each published message to every subscribed viewer.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    #[must_use]
    pub fn new(settings: BroadcastSettings) -> Self {
        Self {
            inner: Arc::new(HubInner {
                settings,
                viewers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new viewer.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.settings.queue_capacity.max(1));
        self.inner.viewers().push(Viewer { id, tx });
        debug!(viewer = id, "viewer subscribed");
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Send `message` to every viewer, honoring the backpressure mode.
    pub async fn publish(&self, message: &PushMessage) {
        let frame: Frame = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(%e, "failed to serialize push message");
                return;
            }
        };

        // Snapshot the senders so the lock is not held while sending.
        let targets: Vec<(u64, mpsc::Sender<Frame>)> = self
            .inner
            .viewers()
            .iter()
            .map(|v| (v.id, v.tx.clone()))
            .collect();

        let mut gone = Vec::new();
        for (id, tx) in targets {
            match self.inner.settings.mode {
                BackpressureMode::Drop => match tx.try_send(Arc::clone(&frame)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(viewer = id, "viewer queue full, message dropped");
                    }
                    Err(TrySendError::Closed(_)) => gone.push(id),
                },
                BackpressureMode::Block => {
                    let timeout = self.inner.settings.block_timeout();
                    match tx.send_timeout(Arc::clone(&frame), timeout).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(_)) => {
                            warn!(viewer = id, ?timeout, "viewer not keeping up, disconnecting");
                            gone.push(id);
                        }
                        Err(SendTimeoutError::Closed(_)) => gone.push(id),
                    }
                }
            }
        }

        self.inner.unsubscribe(&gone);
    }

    /// Drop every viewer. Their subscriptions end once drained.
    pub fn disconnect_all(&self) {
        let count = {
            let mut viewers = self.inner.viewers();
            let count = viewers.len();
            viewers.clear();
            count
        };
        debug!(viewers = count, "all viewers disconnected");
    }

    /// Number of connected viewers.
    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.inner.viewers().len()
    }

    /// Messages dropped because a viewer's queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn settings(&self) -> BroadcastSettings {
        self.inner.settings
    }
}

/// A viewer's end of the hub. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Frame>,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Next frame for this viewer.
    ///
    /// Returns `None` once the hub has disconnected the viewer and its queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&[self.id]);
            debug!(viewer = self.id, "viewer unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LogMessage;
    use std::time::Duration;

    fn message(content: &str) -> PushMessage {
        PushMessage::Log(LogMessage {
            server: "web1".into(),
            file: "app.log".into(),
            content: content.into(),
            timestamp: 0,
        })
    }

    fn settings(mode: BackpressureMode, capacity: usize) -> BroadcastSettings {
        BroadcastSettings {
            mode,
            queue_capacity: capacity,
            block_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_every_viewer_receives() {
        let hub = BroadcastHub::new(BroadcastSettings::default());
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.viewer_count(), 2);

        hub.publish(&message("hello")).await;

        for sub in [&mut a, &mut b] {
            let frame = sub.recv().await.expect("frame");
            let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
            assert_eq!(value["type"], "log");
            assert_eq!(value["content"], "hello");
        }
    }

    #[tokio::test]
    async fn test_publish_without_viewers() {
        let hub = BroadcastHub::new(BroadcastSettings::default());
        hub.publish(&message("nobody listening")).await;
        assert_eq!(hub.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = BroadcastHub::new(BroadcastSettings::default());
        let sub = hub.subscribe();
        assert_eq!(hub.viewer_count(), 1);
        drop(sub);
        assert_eq!(hub.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_all_ends_subscriptions() {
        let hub = BroadcastHub::new(BroadcastSettings::default());
        let mut sub = hub.subscribe();
        hub.publish(&message("last")).await;
        hub.disconnect_all();

        assert_eq!(hub.viewer_count(), 0);
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_mode_never_blocks_on_full_viewer() {
        let hub = BroadcastHub::new(settings(BackpressureMode::Drop, 1));
        let mut slow = hub.subscribe();

        let publish = async {
            hub.publish(&message("one")).await;
            hub.publish(&message("two")).await;
            hub.publish(&message("three")).await;
        };
        tokio::time::timeout(Duration::from_secs(1), publish)
            .await
            .expect("publish should not block");

        assert_eq!(hub.dropped(), 2);
        assert_eq!(hub.viewer_count(), 1);
        let frame = slow.recv().await.expect("first frame kept");
        assert!(frame.contains("one"));
    }

    #[tokio::test]
    async fn test_block_mode_waits_for_space() {
        let hub = BroadcastHub::new(BroadcastSettings {
            block_timeout_ms: 2000,
            ..settings(BackpressureMode::Block, 1)
        });
        let mut viewer = hub.subscribe();

        hub.publish(&message("one")).await;
        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2 {
                seen.push(viewer.recv().await.expect("frame").to_string());
            }
            seen
        });
        hub.publish(&message("two")).await;

        let seen = reader.await.expect("join");
        assert!(seen[0].contains("one"));
        assert!(seen[1].contains("two"));
        assert_eq!(hub.dropped(), 0);
    }

    #[tokio::test]
    async fn test_block_mode_disconnects_stuck_viewer() {
        let hub = BroadcastHub::new(settings(BackpressureMode::Block, 1));
        let mut stuck = hub.subscribe();

        hub.publish(&message("one")).await;
        tokio::time::timeout(Duration::from_secs(1), hub.publish(&message("two")))
            .await
            .expect("publish bounded by block timeout");

        assert_eq!(hub.viewer_count(), 0);
        // The queued frame is still delivered, then the subscription ends.
        assert!(stuck.recv().await.is_some());
        assert!(stuck.recv().await.is_none());
    }
}
