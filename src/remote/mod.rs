//! Remote command execution.
//!
//! The core only talks to hosts through [`Connector`] and [`RemoteChannel`].
//! [`ssh::SshConnector`] is the production implementation; tests use the
//! in-memory fake from [`crate::testing`].

pub mod ssh;

pub use ssh::SshConnector;

use crate::config::ServerProfile;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Any failure talking to a remote host.
///
/// Callers treat every variant the same way; the variants only exist to
/// produce a useful message.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("authentication failed for {user}@{host}")]
    Auth { user: String, host: String },

    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("command exited with status {status}: {stderr}")]
    Exit { status: i32, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Opens authenticated channels to configured hosts.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to the host described by `profile`.
    async fn connect(&self, profile: &ServerProfile)
    -> Result<Box<dyn RemoteChannel>, RemoteError>;
}

/// An open, authenticated channel to one host.
#[async_trait]
pub trait RemoteChannel: Send {
    /// Run a command to completion and return its standard output.
    async fn execute(&mut self, command: &str) -> Result<String, RemoteError>;

    /// Turn this channel into a continuous tail of `path`.
    ///
    /// The stream first yields the last `lines` lines of the file, then
    /// follows appended content until the remote process ends or the
    /// returned stream is closed. The channel is owned by the stream from
    /// here on; on error it has already been released.
    async fn open_tail(self: Box<Self>, path: &str, lines: u32)
    -> Result<TailStream, RemoteError>;

    /// Release the channel. Calling it more than once is harmless.
    fn close(&mut self);
}

/// Release capability for a tail stream.
pub trait StreamCloser: Send + Sync {
    /// Release the stream and its channel.
    ///
    /// Must unblock a read pending on the stream's reader: that read then
    /// returns end-of-stream or an error. Must tolerate repeated calls.
    fn close(&self);
}

/// A readable tail stream plus the capability to release it.
pub struct TailStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub closer: Box<dyn StreamCloser>,
}

impl fmt::Debug for TailStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailStream").finish_non_exhaustive()
    }
}

/// Build the remote command that tails `path`.
#[must_use]
pub fn tail_command(path: &str, lines: u32) -> String {
    format!("tail -n {lines} -f {}", shell_quote(path))
}

/// Quote a string for a POSIX shell.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
