//! Configuration for dsn-node.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root directory for node data.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Networking configuration.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Identity configuration.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Verification round configuration.
    #[serde(default)]
    pub verification: VerificationConfig,
}

/// Networking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Multiaddresses to listen on, each bound independently.
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Bootstrap peer multiaddresses (with `/p2p/` suffix).
    #[serde(default)]
    pub bootstrap: Vec<String>,

    /// Upper bound on a single dial, in seconds.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Upper bound on stream negotiation and a single exchange, in seconds.
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,

    /// Connections with no open streams are closed after this long.
    #[serde(default = "default_idle_timeout")]
    pub idle_connection_timeout_secs: u64,

    /// Largest accepted payload per stream direction, in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Interval between liveness pings on each connection, in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

/// Identity configuration.
///
/// Resolution order: `seed`, then `key_file`, then `<root_dir>/node_key`
/// (generated on first start).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Explicit path to a protobuf-encoded keypair.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Deterministic seed; intended for test networks only.
    #[serde(default)]
    pub seed: Option<String>,
}

/// Verification round configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Custody peers to contact, in order, when a request is accepted.
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            log_level: default_log_level(),
            network: NetworkConfig::default(),
            identity: IdentityConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bootstrap: Vec::new(),
            dial_timeout_secs: default_dial_timeout(),
            stream_timeout_secs: default_stream_timeout(),
            idle_connection_timeout_secs: default_idle_timeout(),
            max_message_bytes: default_max_message_bytes(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl NetworkConfig {
    /// Dial timeout as a [`Duration`].
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Stream timeout as a [`Duration`].
    #[must_use]
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    /// Idle connection timeout as a [`Duration`].
    #[must_use]
    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }

    /// Ping interval as a [`Duration`].
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "dsn")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".dsn"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> Vec<String> {
    vec!["/ip4/0.0.0.0/tcp/4001".to_string()]
}

const fn default_dial_timeout() -> u64 {
    10
}

const fn default_stream_timeout() -> u64 {
    10
}

const fn default_idle_timeout() -> u64 {
    60
}

const fn default_max_message_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

const fn default_ping_interval() -> u64 {
    15
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path of the persisted identity key.
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.identity
            .key_file
            .clone()
            .unwrap_or_else(|| self.root_dir.join(crate::identity::KEY_FILE_NAME))
    }
}
