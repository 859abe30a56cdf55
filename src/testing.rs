//! Test framework for stream lifecycle scenarios.
//!
//! [`FakeRemote`] stands in for the SSH hosts: files live in memory, and
//! appending to a file pushes the new bytes to every tail open on it.
//! [`TestHarness`] runs a real server on a loopback port against the fake.
//!
//! ```ignore
//! let harness = TestHarness::new().await?;
//! harness.control().start("web1", "app.log", 0).await?;
//! harness.remote().append(APP_LOG, b"hello\n");
//! ```

use crate::config::{Config, LogFileSpec, ServerProfile};
use crate::remote::{Connector, RemoteChannel, RemoteError, StreamCloser, TailStream};
use crate::server::{ControlSurface, Server, ServerError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Remote path of `app.log` on `web1`.
pub const APP_LOG: &str = "/var/log/app.log";
/// Remote path of `error.log` on `web1`.
pub const ERROR_LOG: &str = "/var/log/error.log";
/// Remote path of `slow.log` on `db1`.
pub const SLOW_LOG: &str = "/var/log/mysql/slow.log";

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("failed to bind test listener: {0}")]
    Bind(#[source] io::Error),

    #[error("server error: {0}")]
    Server(String),
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> Result<(), TestError>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    let poll_interval = Duration::from_millis(10);

    while Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(poll_interval).await;
    }
    if condition() {
        Ok(())
    } else {
        Err(TestError::Timeout)
    }
}

#[derive(Default)]
struct RemoteState {
    files: HashMap<String, Vec<u8>>,
    tails: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>,
    commands: HashMap<String, String>,
    executed: Vec<String>,
    fail_connects: bool,
    fail_tails: bool,
    connect_delay: Option<Duration>,
    next_tail: u64,
    connections: usize,
    open_channels: usize,
    tails_opened: usize,
    open_tails: usize,
}

/// In-memory hosts with two servers: `web1` (`app.log`, `error.log`) and
/// `db1` (`slow.log`).
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration describing the fake hosts.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            servers: vec![
                profile(
                    "web1",
                    "10.0.0.1",
                    &[("app.log", APP_LOG), ("error.log", ERROR_LOG)],
                ),
                profile("db1", "10.0.0.2", &[("slow.log", SLOW_LOG)]),
            ],
            ..Config::default()
        }
    }

    #[must_use]
    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            remote: self.clone(),
        }
    }

    /// Replace the contents of `path` without notifying open tails.
    pub fn write_file(&self, path: &str, content: &[u8]) {
        self.state().files.insert(path.to_string(), content.to_vec());
    }

    /// Append `bytes` to `path` and push them to every open tail of it.
    ///
    /// Returns how many tails received the bytes.
    pub fn append(&self, path: &str, bytes: &[u8]) -> usize {
        let mut state = self.state();
        state
            .files
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(bytes);
        if bytes.is_empty() {
            return 0;
        }
        state.tails.get(path).map_or(0, |tails| {
            tails
                .iter()
                .filter(|(_, tx)| tx.send(bytes.to_vec()).is_ok())
                .count()
        })
    }

    /// End every tail of `path` as if the remote process exited.
    pub fn end_tails(&self, path: &str) {
        self.state().tails.remove(path);
    }

    /// Make `command` succeed with `output`. Unknown commands fail.
    pub fn set_command_output(&self, command: &str, output: &str) {
        self.state()
            .commands
            .insert(command.to_string(), output.to_string());
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state().fail_connects = fail;
    }

    pub fn fail_tails(&self, fail: bool) {
        self.state().fail_tails = fail;
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state().connect_delay = delay;
    }

    /// Commands executed so far, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Successful connects so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state().connections
    }

    /// Channels not yet released.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.state().open_channels
    }

    /// Tails opened so far.
    #[must_use]
    pub fn tails_opened(&self) -> usize {
        self.state().tails_opened
    }

    /// Tails not yet closed.
    #[must_use]
    pub fn open_tails(&self) -> usize {
        self.state().open_tails
    }
}

fn profile(name: &str, host: &str, files: &[(&str, &str)]) -> ServerProfile {
    ServerProfile {
        name: name.to_string(),
        host: host.to_string(),
        port: 22,
        username: "ops".to_string(),
        password: Some("secret".to_string()),
        key_path: None,
        log_files: files
            .iter()
            .map(|(alias, path)| LogFileSpec {
                path: (*path).to_string(),
                alias: (*alias).to_string(),
            })
            .collect(),
    }
}

/// The last `lines` lines of `content`, the way `tail -n` picks them.
fn last_lines(content: &[u8], lines: u32) -> &[u8] {
    if lines == 0 {
        return &[];
    }
    let body = content.strip_suffix(b"\n").unwrap_or(content);
    let mut seen = 0;
    for (i, byte) in body.iter().enumerate().rev() {
        if *byte == b'\n' {
            seen += 1;
            if seen == lines {
                return &content[i + 1..];
            }
        }
    }
    content
}

/// [`Connector`] over a [`FakeRemote`].
pub struct FakeConnector {
    remote: FakeRemote,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        profile: &ServerProfile,
    ) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        let (fail, delay) = {
            let state = self.remote.state();
            (state.fail_connects, state.connect_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(RemoteError::Connect {
                addr: format!("{}:{}", profile.host, profile.port),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }

        let mut state = self.remote.state();
        state.connections += 1;
        state.open_channels += 1;
        drop(state);

        Ok(Box::new(FakeChannel {
            remote: self.remote.clone(),
            closed: false,
        }))
    }
}

/// A channel to a fake host.
pub struct FakeChannel {
    remote: FakeRemote,
    closed: bool,
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn execute(&mut self, command: &str) -> Result<String, RemoteError> {
        let mut state = self.remote.state();
        state.executed.push(command.to_string());
        state
            .commands
            .get(command)
            .cloned()
            .ok_or_else(|| RemoteError::Exit {
                status: 127,
                stderr: format!("{command}: command not found"),
            })
    }

    async fn open_tail(
        self: Box<Self>,
        path: &str,
        lines: u32,
    ) -> Result<TailStream, RemoteError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.remote.state();
            if state.fail_tails {
                return Err(RemoteError::Other(format!("cannot tail {path}")));
            }

            let initial = state
                .files
                .get(path)
                .map(|content| last_lines(content, lines).to_vec())
                .unwrap_or_default();
            if !initial.is_empty() {
                tx.send(initial).ok();
            }

            state.next_tail += 1;
            let id = state.next_tail;
            state
                .tails
                .entry(path.to_string())
                .or_default()
                .push((id, tx));
            state.tails_opened += 1;
            state.open_tails += 1;
            id
        };

        let remote = self.remote.clone();
        Ok(TailStream {
            reader: Box::new(ChannelReader::new(rx)),
            closer: Box::new(FakeCloser {
                remote,
                path: path.to_string(),
                id,
                channel: Mutex::new(Some(self)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.remote.state().open_channels -= 1;
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct FakeCloser {
    remote: FakeRemote,
    path: String,
    id: u64,
    channel: Mutex<Option<Box<FakeChannel>>>,
    closed: AtomicBool,
}

impl StreamCloser for FakeCloser {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.remote.state();
            if let Some(tails) = state.tails.get_mut(&self.path) {
                tails.retain(|(id, _)| *id != self.id);
            }
            state.open_tails -= 1;
        }
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(channel);
    }
}

impl Drop for FakeCloser {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads chunks pushed through an unbounded channel. Ends when every
/// sender is gone.
struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl ChannelReader {
    const fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.drain(..n);
        Poll::Ready(Ok(()))
    }
}

/// A running server on a loopback port, backed by a [`FakeRemote`].
pub struct TestHarness {
    addr: SocketAddr,
    remote: FakeRemote,
    control: Arc<ControlSurface>,
    shutdown: Option<oneshot::Sender<()>>,
    server_handle: JoinHandle<Result<(), ServerError>>,
}

impl TestHarness {
    /// Start a server with the fake's default configuration.
    pub async fn new() -> Result<Self, TestError> {
        let remote = FakeRemote::new();
        let config = remote.config();
        Self::with_config(remote, config).await
    }

    /// Start a server for `config`, reaching hosts through `remote`.
    pub async fn with_config(remote: FakeRemote, config: Config) -> Result<Self, TestError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(TestError::Bind)?;
        let addr = listener.local_addr().map_err(TestError::Bind)?;

        let server = Server::new(config, Arc::new(remote.connector()));
        let control = Arc::clone(server.control());
        let (tx, rx) = oneshot::channel::<()>();
        let server_handle = tokio::spawn(server.serve(listener, async {
            rx.await.ok();
        }));

        Ok(Self {
            addr,
            remote,
            control,
            shutdown: Some(tx),
            server_handle,
        })
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL of the viewer push channel.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    #[must_use]
    pub const fn remote(&self) -> &FakeRemote {
        &self.remote
    }

    #[must_use]
    pub const fn control(&self) -> &Arc<ControlSurface> {
        &self.control
    }

    /// Shut the server down and wait for it to finish.
    pub async fn shutdown(mut self) -> Result<(), TestError> {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
        match (&mut self.server_handle).await {
            Ok(result) => result.map_err(|e| TestError::Server(e.to_string())),
            Err(e) => Err(TestError::Server(e.to_string())),
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
    }
}
