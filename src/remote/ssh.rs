//! SSH-backed remote channels.
//!
//! `ssh2` is blocking, so every call runs on a blocking thread. A tail
//! stream gets a dedicated reader thread that copies channel output into an
//! in-memory pipe; closing the stream shuts the TCP socket down, which makes
//! the thread's pending read fail and ends the pipe.

use super::{Connector, RemoteChannel, RemoteError, StreamCloser, TailStream, tail_command};
use crate::config::ServerProfile;
use async_trait::async_trait;
use ssh2::Session;
use std::io::Read;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Bytes buffered between the reader thread and the tail pipeline.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Size of a single read from the SSH channel.
const READ_BUFFER: usize = 4096;

/// Opens SSH sessions using the credentials in a [`ServerProfile`].
///
/// Host keys are not verified.
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        profile: &ServerProfile,
    ) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        let profile = profile.clone();
        let timeout = self.connect_timeout;
        let channel = tokio::task::spawn_blocking(move || open_session(&profile, timeout))
            .await
            .map_err(|e| RemoteError::Other(format!("connect task failed: {e}")))??;
        Ok(Box::new(channel))
    }
}

fn open_session(profile: &ServerProfile, timeout: Duration) -> Result<SshChannel, RemoteError> {
    let addr = format!("{}:{}", profile.host, profile.port);
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|source| RemoteError::Connect {
            addr: addr.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| RemoteError::Other(format!("no address found for {addr}")))?;

    let tcp = TcpStream::connect_timeout(&socket_addr, timeout).map_err(|source| {
        if source.kind() == std::io::ErrorKind::TimedOut {
            RemoteError::Timeout(addr.clone())
        } else {
            RemoteError::Connect {
                addr: addr.clone(),
                source,
            }
        }
    })?;
    let socket = tcp.try_clone()?;

    let mut session = Session::new()?;
    // Bounds handshake and auth only; established streams have no timeout.
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    session.set_tcp_stream(tcp);
    session.handshake()?;
    authenticate(&session, profile)?;
    session.set_timeout(0);

    debug!(server = %profile.name, %addr, "SSH session established");
    Ok(SshChannel {
        session: Some(session),
        socket,
        label: profile.name.clone(),
    })
}

/// Try password auth, then public key auth, whichever is configured.
fn authenticate(session: &Session, profile: &ServerProfile) -> Result<(), RemoteError> {
    if let Some(password) = &profile.password {
        if let Err(e) = session.userauth_password(&profile.username, password) {
            debug!(server = %profile.name, %e, "password authentication failed");
        }
    }

    if !session.authenticated() {
        if let Some(key_path) = &profile.key_path {
            if let Err(e) = session.userauth_pubkey_file(&profile.username, None, key_path, None) {
                debug!(server = %profile.name, %e, "public key authentication failed");
            }
        }
    }

    if session.authenticated() {
        Ok(())
    } else {
        Err(RemoteError::Auth {
            user: profile.username.clone(),
            host: profile.host.clone(),
        })
    }
}

/// An authenticated SSH session.
pub struct SshChannel {
    session: Option<Session>,
    /// Clone of the session's socket, used to force it closed.
    socket: TcpStream,
    label: String,
}

impl SshChannel {
    fn session(&self) -> Result<Session, RemoteError> {
        self.session
            .clone()
            .ok_or_else(|| RemoteError::Other("channel already closed".into()))
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn execute(&mut self, command: &str) -> Result<String, RemoteError> {
        let session = self.session()?;
        let command = command.to_string();
        tokio::task::spawn_blocking(move || run_command(&session, &command))
            .await
            .map_err(|e| RemoteError::Other(format!("command task failed: {e}")))?
    }

    async fn open_tail(
        self: Box<Self>,
        path: &str,
        lines: u32,
    ) -> Result<TailStream, RemoteError> {
        let mut this = self;
        let session = this.session()?;
        let command = tail_command(path, lines);
        let started = tokio::task::spawn_blocking(move || -> Result<ssh2::Channel, RemoteError> {
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;
            Ok(channel)
        })
        .await
        .map_err(|e| RemoteError::Other(format!("tail task failed: {e}")));

        let channel = match started {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) | Err(e) => {
                this.close();
                return Err(e);
            }
        };

        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let thread_socket = this.socket.try_clone()?;
        let closer_socket = this.socket.try_clone()?;
        // The reader thread keeps the session alive for as long as it reads.
        let session = this.session.take();
        let label = this.label.clone();
        let runtime = Handle::current();

        std::thread::Builder::new()
            .name(format!("tail-{label}"))
            .spawn(move || {
                forward_output(channel, writer, &runtime, &label);
                drop(session);
                thread_socket.shutdown(Shutdown::Both).ok();
            })?;

        Ok(TailStream {
            reader: Box::new(reader),
            closer: Box::new(SocketCloser {
                socket: closer_socket,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "closing", None) {
                debug!(server = %self.label, %e, "SSH disconnect failed");
            }
            self.socket.shutdown(Shutdown::Both).ok();
            info!(server = %self.label, "SSH session closed");
        }
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_command(session: &Session, command: &str) -> Result<String, RemoteError> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut output = Vec::new();
    channel.read_to_end(&mut output)?;
    let mut stderr = Vec::new();
    channel.stderr().read_to_end(&mut stderr)?;

    channel.wait_close()?;
    let status = channel.exit_status()?;
    if status != 0 {
        return Err(RemoteError::Exit {
            status,
            stderr: decode_output(&stderr).trim_end().to_string(),
        });
    }
    Ok(decode_output(&output))
}

/// Command output as text. Bytes that are not UTF-8 become U+FFFD.
fn decode_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Copy channel output into the pipe until either side goes away.
fn forward_output(
    mut channel: ssh2::Channel,
    mut writer: DuplexStream,
    runtime: &Handle,
    label: &str,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        match channel.read(&mut buf) {
            Ok(0) => {
                debug!(server = %label, "remote tail reached end of stream");
                break;
            }
            Ok(n) => {
                if runtime.block_on(writer.write_all(&buf[..n])).is_err() {
                    debug!(server = %label, "tail reader dropped");
                    break;
                }
            }
            Err(e) => {
                debug!(server = %label, %e, "remote tail read ended");
                break;
            }
        }
    }
    if let Err(e) = channel.close() {
        debug!(server = %label, %e, "failed to close tail channel");
    }
}

/// Closes a tail stream by shutting down its TCP socket.
struct SocketCloser {
    socket: TcpStream,
    closed: AtomicBool,
}

impl StreamCloser for SocketCloser {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            // Already gone when the remote side ended first.
            if e.kind() != std::io::ErrorKind::NotConnected {
                warn!(%e, "failed to shut down tail socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_output_keeps_invalid_utf8() {
        assert_eq!(decode_output(b"ok\xff"), "ok\u{fffd}");
        assert_eq!(decode_output("caf\u{e9}\n".as_bytes()), "caf\u{e9}\n");
        assert_eq!(decode_output(b""), "");
    }
}
