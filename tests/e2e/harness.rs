//! Test harness that runs a small network of dsn nodes on loopback.
//!
//! Node 0 plays the verification authority: it is built last and uses every
//! other node as a custody peer for verification rounds.

use dsn_node::config::{NetworkConfig, NodeConfig};
use dsn_node::request::StaticPeers;
use dsn_node::{Connection, NodeBuilder, RunningNode};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Node failed to build or start.
    #[error("Node error: {0}")]
    Node(#[from] dsn_node::Error),

    /// Temp directory could not be created.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Node not found
    #[error("Node not found: index {0}")]
    NodeNotFound(usize),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Number of nodes, including the authority.
    pub node_count: usize,
    /// Dial timeout for every node.
    pub dial_timeout: Duration,
    /// Stream timeout for every node.
    pub stream_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            node_count: 2,
            dial_timeout: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(30),
        }
    }
}

impl HarnessConfig {
    /// `count` nodes with default timeouts.
    #[must_use]
    pub fn nodes(count: usize) -> Self {
        Self {
            node_count: count,
            ..Self::default()
        }
    }
}

/// A running test network.
pub struct TestHarness {
    nodes: Vec<RunningNode>,
    _dirs: Vec<TempDir>,
}

/// Node configuration listening on an ephemeral loopback port.
pub fn node_config(root: &TempDir, config: &HarnessConfig) -> NodeConfig {
    NodeConfig {
        root_dir: root.path().to_path_buf(),
        network: NetworkConfig {
            listen: vec!["/ip4/127.0.0.1/tcp/0".to_string()],
            dial_timeout_secs: config.dial_timeout.as_secs(),
            stream_timeout_secs: config.stream_timeout.as_secs(),
            ..NetworkConfig::default()
        },
        ..NodeConfig::default()
    }
}

impl TestHarness {
    /// Start a two-node network.
    ///
    /// # Errors
    ///
    /// Returns an error if any node fails to start.
    pub async fn setup() -> Result<Self> {
        Self::setup_with_config(HarnessConfig::default()).await
    }

    /// Start a network described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if any node fails to start.
    pub async fn setup_with_config(config: HarnessConfig) -> Result<Self> {
        info!("Setting up test harness with {} nodes", config.node_count);

        let mut dirs = Vec::with_capacity(config.node_count);
        let mut custodians = Vec::new();
        for _ in 1..config.node_count {
            let dir = TempDir::new()?;
            let node = NodeBuilder::new(node_config(&dir, &config)).build().await?;
            custodians.push(node);
            dirs.push(dir);
        }

        let peers = custodians
            .iter()
            .flat_map(|n| n.handle().dialable_addrs())
            .collect();
        let dir = TempDir::new()?;
        let authority = NodeBuilder::new(node_config(&dir, &config))
            .with_peer_source(Arc::new(StaticPeers::new(peers)))
            .build()
            .await?;
        dirs.push(dir);

        let mut nodes = vec![authority];
        nodes.extend(custodians);
        Ok(Self { nodes, _dirs: dirs })
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node by index; 0 is the authority.
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&RunningNode> {
        self.nodes.get(index)
    }

    /// Dial node `to` from node `from`.
    ///
    /// # Errors
    ///
    /// Returns an error if either index is out of range or the dial fails.
    pub async fn connect(&self, from: usize, to: usize) -> Result<Connection> {
        let target = self.node(to).ok_or(HarnessError::NodeNotFound(to))?;
        let source = self.node(from).ok_or(HarnessError::NodeNotFound(from))?;
        let addr = target
            .handle()
            .dialable_addrs()
            .into_iter()
            .next()
            .ok_or(HarnessError::NodeNotFound(to))?;
        Ok(source.handle().dial(&addr).await?)
    }

    /// Stop every node.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown error.
    pub async fn teardown(self) -> Result<()> {
        info!("Tearing down test harness");
        for node in &self.nodes {
            node.stop().await?;
        }
        Ok(())
    }
}
