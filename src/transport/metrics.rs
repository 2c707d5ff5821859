//! Point-in-time view of a node's connections.

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use std::fmt;
use std::time::Duration;

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote dialed us.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        })
    }
}

/// One connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMetrics {
    /// Remote peer.
    pub peer_id: PeerId,
    /// Remote address of the connection in use.
    pub address: Multiaddr,
    /// Who dialed.
    pub direction: Direction,
    /// When the connection was established.
    pub connected_since: DateTime<Utc>,
    /// Last measured round-trip time, once a ping has completed.
    pub latency: Option<Duration>,
    /// Pings that failed since the last successful one.
    pub ping_failures: u32,
}

/// Latency summary over peers with a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    /// Mean round-trip time.
    pub avg: Duration,
    /// Fastest peer.
    pub min: Duration,
    /// Slowest peer.
    pub max: Duration,
}

/// Snapshot returned by [`NodeHandle::metrics`](super::NodeHandle::metrics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMetrics {
    /// This node.
    pub local_peer_id: PeerId,
    /// Time since the transport started.
    pub uptime: Duration,
    /// Connected peers, ordered by peer id.
    pub peers: Vec<PeerMetrics>,
}

impl NetworkMetrics {
    /// Number of connected peers.
    #[must_use]
    pub fn connected_peers(&self) -> usize {
        self.peers.len()
    }

    /// Peers connected in `direction`.
    #[must_use]
    pub fn count(&self, direction: Direction) -> usize {
        self.peers.iter().filter(|p| p.direction == direction).count()
    }

    /// Metrics for one peer.
    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerMetrics> {
        self.peers.iter().find(|p| &p.peer_id == peer_id)
    }

    /// Average, fastest and slowest round-trip time; `None` before any ping
    /// has completed.
    #[must_use]
    pub fn latency_stats(&self) -> Option<LatencyStats> {
        let samples: Vec<Duration> = self.peers.iter().filter_map(|p| p.latency).collect();
        let min = samples.iter().min().copied()?;
        let max = samples.iter().max().copied()?;
        let total: Duration = samples.iter().sum();
        let count = u32::try_from(samples.len()).unwrap_or(u32::MAX);
        Some(LatencyStats {
            avg: total / count,
            min,
            max,
        })
    }
}
