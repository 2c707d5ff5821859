//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use dsn_node::config::NodeConfig;
use std::path::PathBuf;

/// Custody node for the decentralized verification network.
#[derive(Parser, Debug)]
#[command(name = "dsn-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for node data.
    #[arg(long, env = "DSN_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// Listen multiaddresses (comma separated). Overrides --port.
    #[arg(long, short, env = "DSN_LISTEN", value_delimiter = ',')]
    pub listen: Vec<String>,

    /// TCP port to listen on all IPv4 interfaces (0 for auto-select).
    #[arg(long, short, env = "DSN_PORT")]
    pub port: Option<u16>,

    /// Bootstrap peer multiaddresses, each ending in /p2p/<peer id>.
    #[arg(long, short, env = "DSN_BOOTSTRAP_PEERS", value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Custody peers to contact for verification rounds.
    #[arg(long, env = "DSN_VERIFICATION_PEERS", value_delimiter = ',')]
    pub verification_peers: Vec<String>,

    /// Path to the node key file.
    #[arg(long, env = "DSN_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Derive the node identity from this seed (test networks only).
    #[arg(long, env = "DSN_SEED")]
    pub seed: Option<String>,

    /// Dial timeout in seconds.
    #[arg(long, env = "DSN_DIAL_TIMEOUT")]
    pub dial_timeout: Option<u64>,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "DSN_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

/// Log format CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human readable.
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Convert CLI arguments into a NodeConfig.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<NodeConfig> {
        let mut config = if let Some(ref path) = self.config {
            NodeConfig::from_file(path)?
        } else {
            NodeConfig::default()
        };

        if let Some(root_dir) = self.root_dir {
            config.root_dir = root_dir;
        }

        if !self.listen.is_empty() {
            config.network.listen = self.listen;
        } else if let Some(port) = self.port {
            config.network.listen = vec![format!("/ip4/0.0.0.0/tcp/{port}")];
        }
        if !self.bootstrap.is_empty() {
            config.network.bootstrap = self.bootstrap;
        }
        if let Some(secs) = self.dial_timeout {
            config.network.dial_timeout_secs = secs;
        }
        if !self.verification_peers.is_empty() {
            config.verification.peers = self.verification_peers;
        }

        if self.key_file.is_some() {
            config.identity.key_file = self.key_file;
        }
        if self.seed.is_some() {
            config.identity.seed = self.seed;
        }
        config.log_level = self.log_level;

        Ok(config)
    }
}
