//! Configuration file loading.
//!
//! The server list is read once at startup from a YAML file and never
//! mutated afterwards. Anything wrong with it is fatal.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Default relative location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

/// Resolve the config path to use when none was given explicitly.
///
/// Prefers `config/config.yaml` relative to the working directory and falls
/// back to the per-user config directory.
#[must_use]
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_PATH);
    if local.exists() {
        return local;
    }
    dirs::config_dir().map_or(local, |dir| dir.join("logview").join("config.yaml"))
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote hosts and the log files watched on each.
    #[serde(default)]
    pub servers: Vec<ServerProfile>,
    /// Tail pipeline settings.
    #[serde(default)]
    pub stream: StreamSettings,
    /// Viewer fan-out settings.
    #[serde(default)]
    pub broadcast: BroadcastSettings,
}

/// A remote host reachable over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    /// Unique server name.
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Path to a private key on the machine running logview.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub log_files: Vec<LogFileSpec>,
}

impl ServerProfile {
    /// Look up a log file by alias.
    #[must_use]
    pub fn log_file(&self, alias: &str) -> Option<&LogFileSpec> {
        self.log_files.iter().find(|f| f.alias == alias)
    }
}

/// A log file on a remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileSpec {
    /// Absolute path on the remote host.
    pub path: String,
    /// Name shown to viewers; unique per server.
    pub alias: String,
}

/// Tail pipeline settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Maximum bytes read from a remote stream per message.
    pub chunk_size: usize,
    /// Upper bound on establishing a remote channel.
    pub connect_timeout_secs: u64,
}

impl StreamSettings {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            connect_timeout_secs: 10,
        }
    }
}

/// How the broadcast hub treats a viewer that is not keeping up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Never wait; a viewer with a full queue misses the message.
    #[default]
    Drop,
    /// Wait for queue space, up to `block_timeout_ms`, then disconnect the viewer.
    Block,
}

/// Viewer fan-out settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    pub mode: BackpressureMode,
    /// Messages buffered per viewer.
    pub queue_capacity: usize,
    pub block_timeout_ms: u64,
}

impl BroadcastSettings {
    #[must_use]
    pub const fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            mode: BackpressureMode::Drop,
            queue_capacity: 256,
            block_timeout_ms: 2000,
        }
    }
}

const fn default_port() -> u16 {
    22
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    /// Parse and validate config from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(data).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a server by name.
    #[must_use]
    pub fn server(&self, name: &str) -> Option<&ServerProfile> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Check the invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(ConfigError::Invalid("server name cannot be empty".into()));
            }
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
            if server.host.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {} has an empty host",
                    server.name
                )));
            }
            if server.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "server {} has port 0",
                    server.name
                )));
            }

            let mut aliases = HashSet::new();
            for file in &server.log_files {
                if file.alias.is_empty() || file.path.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "server {} has a log file with an empty path or alias",
                        server.name
                    )));
                }
                if !aliases.insert(file.alias.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "server {} has duplicate log alias: {}",
                        server.name, file.alias
                    )));
                }
            }
        }

        if self.stream.chunk_size == 0 {
            return Err(ConfigError::Invalid("stream.chunk_size must be positive".into()));
        }
        if self.stream.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "stream.connect_timeout_secs must be positive".into(),
            ));
        }
        if self.broadcast.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broadcast.queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}
