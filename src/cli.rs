//! Command-line interface for logview.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default address the HTTP server binds.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Live tail of log files on remote servers.
#[derive(Debug, Parser)]
#[command(name = "logview", version, about)]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long, global = true, env = "LOGVIEW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server and viewer push channel.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "LOGVIEW_LISTEN", default_value = DEFAULT_LISTEN)]
        listen: SocketAddr,

        /// Directory of static UI files served for non-API paths.
        #[arg(long, env = "LOGVIEW_STATIC_DIR")]
        static_dir: Option<PathBuf>,
    },

    /// Validate the config file and list the configured servers.
    Check {
        /// Print JSON instead of TOON.
        #[arg(long)]
        json: bool,
    },
}
