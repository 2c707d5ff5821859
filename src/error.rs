//! Error types for dsn-node.

use crate::request::RequestStatus;
use std::fmt;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in dsn-node.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to bind or listen on a configured address. Fatal at start-up.
    #[error("transport error: {0}")]
    Transport(String),

    /// A multiaddress could not be parsed or is missing a required component.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The remote peer was unreachable, refused the connection, or the dial
    /// timed out. Callers may retry with backoff.
    #[error("dial to {target} failed: {reason}")]
    Dial {
        /// Peer id or address that was dialed.
        target: String,
        /// Human readable cause.
        reason: String,
    },

    /// The secure handshake failed or authenticated the wrong peer.
    #[error("handshake with {target} failed: {reason}")]
    Handshake {
        /// Peer id or address that was dialed.
        target: String,
        /// Human readable cause.
        reason: String,
    },

    /// Protocol negotiation or payload exchange failed.
    #[error("protocol {protocol}: {kind}")]
    Protocol {
        /// Protocol identifier involved.
        protocol: String,
        /// What went wrong.
        kind: ProtocolErrorKind,
    },

    /// An envelope failed its integrity check.
    #[error("envelope authentication failed")]
    Authentication,

    /// A verification request was asked to make a forbidden status change.
    #[error("request {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Request identifier.
        id: String,
        /// Status at the time of the attempt.
        from: RequestStatus,
        /// Requested status.
        to: RequestStatus,
    },

    /// A request changed between being read and being written back.
    #[error("request {id} changed concurrently (revision {found}, expected {expected})")]
    Conflict {
        /// Request identifier.
        id: String,
        /// Revision the writer read.
        expected: u64,
        /// Revision found in the store.
        found: u64,
    },

    /// Unknown identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// A criteria rule could not be applied to its operands.
    #[error("criteria error: {0}")]
    Criteria(String),

    /// Identity key error.
    #[error("identity error: {0}")]
    Identity(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persistence collaborator error.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The node has been shut down.
    #[error("node is shut down")]
    Shutdown,
}

/// Sub-kinds of [`Error::Protocol`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// The remote (or local) side does not speak the protocol.
    UnsupportedProtocol,
    /// A handler for this protocol is already registered.
    AlreadyRegistered,
    /// The identifier is not a valid versioned protocol string.
    InvalidIdentifier,
    /// The payload did not match the protocol's schema.
    Malformed(String),
    /// Negotiation or exchange exceeded its deadline.
    Timeout,
    /// Stream I/O failed mid-exchange.
    Io(String),
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedProtocol => f.write_str("unsupported protocol"),
            Self::AlreadyRegistered => f.write_str("handler already registered"),
            Self::InvalidIdentifier => f.write_str("invalid protocol identifier"),
            Self::Malformed(reason) => write!(f, "malformed payload: {reason}"),
            Self::Timeout => f.write_str("timed out"),
            Self::Io(reason) => write!(f, "stream I/O: {reason}"),
        }
    }
}

impl Error {
    pub(crate) fn protocol(protocol: impl fmt::Display, kind: ProtocolErrorKind) -> Self {
        Self::Protocol {
            protocol: protocol.to_string(),
            kind,
        }
    }

    /// Whether the failed operation may succeed if retried later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Dial { .. } | Self::Io(_) => true,
            Self::Protocol { kind, .. } => {
                matches!(kind, ProtocolErrorKind::Timeout | ProtocolErrorKind::Io(_))
            }
            _ => false,
        }
    }

    /// Whether the error originated in the network layer rather than in
    /// request validation.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Dial { .. }
                | Self::Handshake { .. }
                | Self::Protocol { .. }
                | Self::Shutdown
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
