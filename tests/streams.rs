//! Stream lifecycle scenarios against the in-memory remote.

use logview::config::{BackpressureMode, BroadcastSettings, Config};
use logview::protocol::PushMessage;
use logview::server::{
    BroadcastHub, ControlError, ControlSurface, StreamIdentity, StreamRegistry, Subscription,
};
use logview::testing::{APP_LOG, ERROR_LOG, FakeRemote, wait_for};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};

const WAIT: Duration = Duration::from_secs(2);

fn surface(remote: &FakeRemote, config: Config) -> ControlSurface {
    let hub = BroadcastHub::new(config.broadcast);
    ControlSurface::new(
        Arc::new(config),
        Arc::new(remote.connector()),
        Arc::new(StreamRegistry::new()),
        hub,
    )
}

fn default_surface(remote: &FakeRemote) -> ControlSurface {
    surface(remote, remote.config())
}

/// Receive frames until `expected.len()` bytes of content for `file` arrived.
async fn collect(viewer: &mut Subscription, file: &str, expected: &str) -> String {
    let mut content = String::new();
    while content.len() < expected.len() {
        let frame = timeout(Duration::from_secs(5), viewer.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("subscription ended");
        let PushMessage::Log(log) = serde_json::from_str(&frame).unwrap();
        if log.file == file {
            content.push_str(&log.content);
        }
    }
    content
}

#[tokio::test]
async fn test_identity_never_has_two_handles() {
    let remote = FakeRemote::new();
    let control = default_surface(&remote);
    let identity = StreamIdentity::new("web1", "app.log");

    let steps = ["start", "start", "stop", "start", "stop", "stop", "start", "start"];
    for step in steps {
        match step {
            "start" => match control.start("web1", "app.log", 0).await {
                Ok(()) | Err(ControlError::Conflict(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            },
            _ => control.stop("web1", "app.log"),
        }
        let handles = control
            .registry()
            .list()
            .into_iter()
            .filter(|h| h.identity() == &identity)
            .count();
        assert!(handles <= 1);
        assert!(remote.open_tails() <= 2);
    }

    control.shutdown().await;
    assert_eq!(remote.open_tails(), 0);
    assert_eq!(remote.open_channels(), 0);
}

#[tokio::test]
async fn test_slow_connect_is_bounded_by_timeout() {
    let remote = FakeRemote::new();
    remote.set_connect_delay(Some(Duration::from_secs(5)));
    let mut config = remote.config();
    config.stream.connect_timeout_secs = 1;
    let control = surface(&remote, config);

    let started = Instant::now();
    let err = control.start("web1", "app.log", 0).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ControlError::Connection { .. }), "{err}");
    assert!(err.to_string().contains("timed out"), "{err}");
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert!(control.registry().is_empty());
    assert_eq!(remote.connections(), 0);
    assert_eq!(remote.open_channels(), 0);
}

#[tokio::test]
async fn test_second_start_conflicts_and_first_keeps_producing() {
    let remote = FakeRemote::new();
    let control = default_surface(&remote);
    let mut viewer = control.hub().subscribe();

    control.start("web1", "app.log", 0).await.unwrap();
    let err = control.start("web1", "app.log", 0).await.unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));

    assert_eq!(remote.tails_opened(), 2);
    assert_eq!(remote.open_tails(), 1);
    assert_eq!(remote.open_channels(), 1);

    assert_eq!(remote.append(APP_LOG, b"still here\n"), 1);
    assert_eq!(collect(&mut viewer, "app.log", "still here\n").await, "still here\n");

    control.shutdown().await;
}

#[tokio::test]
async fn test_stop_absent_is_idempotent() {
    let remote = FakeRemote::new();
    let control = default_surface(&remote);

    control.stop("web1", "app.log");
    control.start("web1", "app.log", 0).await.unwrap();
    control.stop("web1", "app.log");
    control.stop("web1", "app.log");
    control.stop("nope", "missing.log");

    assert!(control.registry().is_empty());
    wait_for(|| control.live_pipelines() == 0, WAIT).await.unwrap();
}

#[tokio::test]
async fn test_start_then_immediate_stop() {
    let remote = FakeRemote::new();
    let control = default_surface(&remote);

    control.start("db1", "slow.log", 0).await.unwrap();
    control.stop("db1", "slow.log");

    wait_for(|| control.live_pipelines() == 0, WAIT).await.unwrap();
    assert!(control.registry().is_empty());
    assert_eq!(remote.open_tails(), 0);
    assert_eq!(remote.open_channels(), 0);
}

#[tokio::test]
async fn test_concatenated_content_matches_appended_bytes() {
    let remote = FakeRemote::new();
    let mut config = remote.config();
    config.stream.chunk_size = 3;
    let control = surface(&remote, config);
    let mut viewer = control.hub().subscribe();

    control.start("web1", "app.log", 0).await.unwrap();

    let text = "ERROR 日本語 ünïcödé ✓\nnext line\n";
    let bytes = text.as_bytes();
    // Split inside multi-byte characters on purpose.
    for piece in [&bytes[..7], &bytes[7..10], &bytes[10..19], &bytes[19..]] {
        remote.append(APP_LOG, piece);
    }

    assert_eq!(collect(&mut viewer, "app.log", text).await, text);
    control.shutdown().await;
}

#[tokio::test]
async fn test_initial_lines_then_follow() {
    let remote = FakeRemote::new();
    remote.write_file(ERROR_LOG, b"e1\ne2\ne3\ne4\n");
    let control = default_surface(&remote);
    let mut viewer = control.hub().subscribe();

    control.start("web1", "error.log", 2).await.unwrap();
    assert_eq!(collect(&mut viewer, "error.log", "e3\ne4\n").await, "e3\ne4\n");

    remote.append(ERROR_LOG, b"e5\n");
    assert_eq!(collect(&mut viewer, "error.log", "e5\n").await, "e5\n");
    control.shutdown().await;
}

#[tokio::test]
async fn test_stop_while_blocked_reading() {
    let remote = FakeRemote::new();
    let control = default_surface(&remote);
    let identity = StreamIdentity::new("web1", "app.log");

    control.start("web1", "app.log", 0).await.unwrap();
    assert_eq!(control.live_pipelines(), 1);
    // Nothing was appended, so the pipeline is parked on its read.
    tokio::time::sleep(Duration::from_millis(20)).await;

    control.stop("web1", "app.log");
    assert!(!control.registry().contains(&identity));

    wait_for(|| control.live_pipelines() == 0, WAIT).await.unwrap();
    assert_eq!(control.registry().running_tasks(), 0);
    assert_eq!(remote.open_tails(), 0);
}

#[tokio::test]
async fn test_remote_end_deregisters_stream() {
    let remote = FakeRemote::new();
    let control = default_surface(&remote);
    let identity = StreamIdentity::new("web1", "app.log");

    control.start("web1", "app.log", 0).await.unwrap();
    remote.end_tails(APP_LOG);

    let registry = Arc::clone(control.registry());
    wait_for(|| !registry.contains(&identity), WAIT).await.unwrap();
    wait_for(|| control.live_pipelines() == 0, WAIT).await.unwrap();
    assert_eq!(remote.open_tails(), 0);

    // A dead stream needs a new start.
    control.start("web1", "app.log", 0).await.unwrap();
    assert!(registry.contains(&identity));
    control.shutdown().await;
}

#[tokio::test]
async fn test_stale_pipeline_keeps_newer_stream() {
    let remote = FakeRemote::new();
    let control = default_surface(&remote);
    let identity = StreamIdentity::new("web1", "app.log");
    let mut viewer = control.hub().subscribe();

    control.start("web1", "app.log", 0).await.unwrap();
    let first = control.registry().lookup(&identity).unwrap().generation();
    control.stop("web1", "app.log");
    control.start("web1", "app.log", 0).await.unwrap();
    let second = control.registry().lookup(&identity).unwrap().generation();
    assert_ne!(first, second);

    // Once the stopped pipeline has wound down, the new stream is untouched.
    wait_for(|| control.live_pipelines() == 1, WAIT).await.unwrap();
    let current = control.registry().lookup(&identity).unwrap();
    assert_eq!(current.generation(), second);
    assert!(!current.is_closed());

    remote.append(APP_LOG, b"from the new stream\n");
    assert_eq!(
        collect(&mut viewer, "app.log", "from the new stream\n").await,
        "from the new stream\n"
    );
    control.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_leaves_nothing_running() {
    let remote = FakeRemote::new();
    let control = default_surface(&remote);

    control.start("web1", "app.log", 0).await.unwrap();
    control.start("web1", "error.log", 0).await.unwrap();
    control.start("db1", "slow.log", 0).await.unwrap();
    control.stop("web1", "error.log");
    assert_eq!(control.streams().len(), 2);

    timeout(Duration::from_secs(5), control.shutdown())
        .await
        .expect("shutdown should not hang");

    assert!(control.registry().is_empty());
    assert!(control.streams().is_empty());
    assert_eq!(control.live_pipelines(), 0);
    assert_eq!(remote.open_tails(), 0);
    assert_eq!(remote.open_channels(), 0);
}

#[tokio::test]
async fn test_drop_mode_pipeline_not_held_by_stuck_viewer() {
    let remote = FakeRemote::new();
    let mut config = remote.config();
    config.broadcast = BroadcastSettings {
        mode: BackpressureMode::Drop,
        queue_capacity: 1,
        block_timeout_ms: 50,
    };
    let control = surface(&remote, config);
    let _stuck = control.hub().subscribe();

    control.start("web1", "app.log", 0).await.unwrap();
    for line in ["one\n", "two\n", "three\n"] {
        remote.append(APP_LOG, line.as_bytes());
    }

    let hub = control.hub().clone();
    wait_for(|| hub.dropped() >= 2, WAIT).await.unwrap();
    assert_eq!(hub.viewer_count(), 1);

    control.stop("web1", "app.log");
    wait_for(|| control.live_pipelines() == 0, WAIT).await.unwrap();
}

#[tokio::test]
async fn test_block_mode_disconnects_stuck_viewer() {
    let remote = FakeRemote::new();
    let mut config = remote.config();
    config.broadcast = BroadcastSettings {
        mode: BackpressureMode::Block,
        queue_capacity: 1,
        block_timeout_ms: 50,
    };
    let control = surface(&remote, config);
    let mut stuck = control.hub().subscribe();

    control.start("web1", "app.log", 0).await.unwrap();
    remote.append(APP_LOG, b"one\n");
    remote.append(APP_LOG, b"two\n");

    let hub = control.hub().clone();
    wait_for(|| hub.viewer_count() == 0, WAIT).await.unwrap();
    assert!(control.registry().contains(&StreamIdentity::new("web1", "app.log")));

    assert!(stuck.recv().await.is_some());
    assert!(stuck.recv().await.is_none());
    control.shutdown().await;
}
