//! logview: live tail of log files on remote servers.
//!
//! Tails configured files over SSH and pushes their output to every
//! connected browser viewer. One-off commands can be run on the same hosts.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod config;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod testing;

pub use cli::{Cli, Command};
pub use config::{Config, ConfigError, default_config_path};
pub use protocol::{
    ChunkDecoder, CommandRequest, CommandResponse, LogMessage, PushMessage, ServerSummary,
    StartRequest, StopRequest, StreamInfo,
};
pub use remote::{Connector, RemoteChannel, RemoteError, SshConnector};
pub use server::{ControlError, ControlSurface, Server, ServerError};
pub use testing::{FakeRemote, TestError, TestHarness};
