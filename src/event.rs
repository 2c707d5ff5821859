//! Node event system.

use crate::protocol::message::Verdict;
use crate::request::RequestStatus;
use tokio::sync::broadcast;

/// Events emitted by the node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Node has started successfully.
    Started,

    /// Node is shutting down.
    ShuttingDown,

    /// A listen address became active.
    ListeningOn {
        /// Full multiaddress including the `/p2p/` suffix.
        address: String,
    },

    /// Connected to a peer.
    PeerConnected {
        /// Peer identifier.
        peer_id: String,
    },

    /// Disconnected from a peer.
    PeerDisconnected {
        /// Peer identifier.
        peer_id: String,
    },

    /// Custody of a user record was accepted.
    UserEnrolled {
        /// User identifier.
        user_id: String,
    },

    /// An encrypted data block was stored.
    DataStored {
        /// Content hash of the envelope.
        hash: String,
    },

    /// A verification request was created.
    RequestCreated {
        /// Request identifier.
        request_id: String,
    },

    /// A verification request reached a new status.
    RequestResolved {
        /// Request identifier.
        request_id: String,
        /// New status.
        status: RequestStatus,
    },

    /// A custody peer answered a verification round.
    VerificationDispatched {
        /// Request identifier.
        request_id: String,
        /// Peer that answered.
        peer_id: String,
        /// The peer's answer.
        verdict: Verdict,
    },

    /// The network step of a verification round failed; status unchanged.
    DispatchFailed {
        /// Request identifier.
        request_id: String,
        /// Failure description.
        reason: String,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving node events.
pub type NodeEventsChannel = broadcast::Receiver<NodeEvent>;

/// Sender for node events.
pub type NodeEventsSender = broadcast::Sender<NodeEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (NodeEventsSender, NodeEventsChannel) {
    broadcast::channel(256)
}
