//! # dsn-node
//!
//! Peer-to-peer node of a decentralized verification network. A trusted
//! authority verifies a user's data once, seals it, and hands custody to
//! independent peers, which later answer yes/no eligibility questions about
//! it without revealing the data.
//!
//! ## Components
//!
//! - [`identity`] and [`transport`]: Ed25519 peer identity and Noise/Yamux
//!   connections over TCP, one connection per remote peer.
//! - [`protocol`]: versioned application protocols multiplexed as streams,
//!   with typed payloads and built-in custody handlers.
//! - [`cipher`]: AES-256-GCM envelopes (`nonce || ciphertext || tag`).
//! - [`criteria`]: `All`/`Any` rule evaluation over JSON records.
//! - [`request`]: the verification request state machine and the network
//!   round triggered on acceptance.
//! - [`store`]: persistence contracts and an in-memory implementation.
//!
//! ## Example
//!
//! ```no_run
//! use dsn_node::{NodeBuilder, NodeConfig};
//!
//! # async fn run() -> dsn_node::Result<()> {
//! let mut node = NodeBuilder::new(NodeConfig::default()).build().await?;
//! node.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod cipher;
pub mod config;
pub mod criteria;
pub mod custody;
pub mod error;
pub mod event;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod request;
pub mod store;
pub mod transport;

pub use cipher::{open, seal, EncryptedEnvelope, EnvelopeKey};
pub use config::NodeConfig;
pub use criteria::{evaluate, Comparison, Criteria, Record, Rule};
pub use error::{Error, ProtocolErrorKind, Result};
pub use event::{NodeEvent, NodeEventsChannel};
pub use identity::PeerIdentity;
pub use node::{NodeBuilder, RunningNode};
pub use protocol::{Ack, Multiplexer, ProtocolId, ProtocolStream, StreamHandler};
pub use request::{Decision, RequestManager, RequestStatus, VerificationRequest};
pub use transport::{Connection, NetworkMetrics, NodeHandle};

pub use libp2p::{Multiaddr, PeerId};
