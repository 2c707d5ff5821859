//! Node identity and transport.
//!
//! A node listens on every configured multiaddress and maintains
//! authenticated (Noise), multiplexed (Yamux) TCP connections to remote
//! peers. At most one connection per remote peer is kept; concurrent dials to
//! the same peer share the first dial's outcome.

pub mod address;
mod behaviour;
pub(crate) mod closure;
mod driver;
mod handle;
mod metrics;

pub use address::{parse_multiaddr, parse_peer_addr, split_peer_id, with_peer_id};
pub use behaviour::IDENTIFY_PROTOCOL;
pub use handle::NodeHandle;
pub use metrics::{Direction, LatencyStats, NetworkMetrics, PeerMetrics};

use libp2p::swarm::ConnectionId;
use libp2p::{Multiaddr, PeerId};

/// An established connection to one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    peer_id: PeerId,
    connection_id: ConnectionId,
    remote_addr: Multiaddr,
}

impl Connection {
    /// The authenticated remote peer.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Swarm-local identifier of this connection.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Remote address the connection runs over.
    #[must_use]
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }
}
