//! Network side of a verification round.
//!
//! Peers are supplied from outside through [`PeerSource`]; discovery is not
//! this crate's concern.

use crate::cipher::{self, EnvelopeKey};
use crate::criteria::Record;
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::protocol::message::{self, NewUser, ProtocolId, Receipt, Verdict, VerifyRequest, VerifyResponse};
use crate::protocol::Multiplexer;
use crate::request::VerificationRequest;
use crate::transport::{parse_multiaddr, split_peer_id, with_peer_id, NodeHandle};
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a custody peer answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Peer that answered.
    pub peer_id: PeerId,
    /// Its verdict.
    pub verdict: Verdict,
}

/// Runs the network step of an accepted request.
#[async_trait]
pub trait VerificationDispatcher: Send + Sync {
    /// Ask custody peers to evaluate `request`'s criteria for its subject.
    async fn dispatch(&self, request: &VerificationRequest) -> Result<DispatchOutcome>;
}

/// Supplies the addresses of peers to contact, in preference order.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Current candidate peers.
    async fn peers(&self) -> Result<Vec<Multiaddr>>;
}

/// A fixed peer list, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers(Vec<Multiaddr>);

impl StaticPeers {
    /// Wrap already-parsed addresses.
    #[must_use]
    pub fn new(addrs: Vec<Multiaddr>) -> Self {
        Self(addrs)
    }

    /// Parse address strings.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAddress`] for the first bad entry.
    pub fn parse(addrs: &[String]) -> Result<Self> {
        addrs
            .iter()
            .map(|a| parse_multiaddr(a))
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

#[async_trait]
impl PeerSource for StaticPeers {
    async fn peers(&self) -> Result<Vec<Multiaddr>> {
        Ok(self.0.clone())
    }
}

/// Whatever peers the node is connected to right now.
#[derive(Debug, Clone)]
pub struct ConnectedPeers(NodeHandle);

impl ConnectedPeers {
    /// Peers of `node`.
    #[must_use]
    pub fn new(node: NodeHandle) -> Self {
        Self(node)
    }
}

#[async_trait]
impl PeerSource for ConnectedPeers {
    async fn peers(&self) -> Result<Vec<Multiaddr>> {
        Ok(self
            .0
            .connections()
            .await?
            .iter()
            .map(|c| with_peer_id(c.remote_addr(), c.peer_id()))
            .collect())
    }
}

/// [`VerificationDispatcher`] that talks `/verify/1.0.0` to custody peers.
#[derive(Clone)]
pub struct NetworkDispatcher {
    mux: Multiplexer,
    peers: Arc<dyn PeerSource>,
}

impl std::fmt::Debug for NetworkDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDispatcher")
            .field("node", &self.mux.node().local_peer_id())
            .finish_non_exhaustive()
    }
}

impl NetworkDispatcher {
    /// Dispatcher sending through `mux` to peers from `peers`.
    #[must_use]
    pub fn new(mux: Multiplexer, peers: Arc<dyn PeerSource>) -> Self {
        Self { mux, peers }
    }

    async fn candidates(&self) -> Result<Vec<Multiaddr>> {
        let peers = self.peers.peers().await?;
        if peers.is_empty() {
            return Err(Error::Dial {
                target: "verification peers".to_string(),
                reason: "no peers available".to_string(),
            });
        }
        Ok(peers)
    }

    async fn ask(&self, addr: &Multiaddr, request: &VerifyRequest) -> Result<DispatchOutcome> {
        let connection = self.mux.node().dial(addr).await?;
        let protocol = ProtocolId::builtin(message::VERIFY);
        let response: VerifyResponse = self.mux.request(&connection, &protocol, request).await?;
        if response.request_id != request.request_id {
            return Err(Error::protocol(
                &protocol,
                ProtocolErrorKind::Malformed(format!(
                    "answer for {} instead of {}",
                    response.request_id, request.request_id
                )),
            ));
        }
        Ok(DispatchOutcome {
            peer_id: connection.peer_id(),
            verdict: response.verdict,
        })
    }

    /// Seal `record` under a fresh key and hand custody of it to the first
    /// peer that accepts.
    ///
    /// # Errors
    ///
    /// The last peer's error if none accepted.
    pub async fn enroll(&self, user_id: &str, record: &Record) -> Result<PeerId> {
        let plaintext = serde_json::to_vec(record)?;
        let (key, envelope) = tokio::task::spawn_blocking(move || {
            let key = EnvelopeKey::generate();
            cipher::seal(&plaintext, &key).map(|envelope| (key, envelope))
        })
        .await
        .map_err(|e| Error::Serialization(format!("sealing task failed: {e}")))??;

        let message = NewUser {
            id: user_id.to_string(),
            u: envelope.to_base64(),
            k: key.to_base64(),
        };
        let protocol = ProtocolId::builtin(message::NEW_USER);

        let mut last_error = None;
        for addr in self.candidates().await? {
            let attempt = async {
                let connection = self.mux.node().dial(&addr).await?;
                let receipt: Receipt = self.mux.request(&connection, &protocol, &message).await?;
                Ok::<_, Error>((connection.peer_id(), receipt))
            };
            match attempt.await {
                Ok((peer, receipt)) if receipt.id == user_id => {
                    info!(%peer, user_id, "Enrolled user record");
                    return Ok(peer);
                }
                Ok((peer, receipt)) => {
                    warn!(%peer, expected = user_id, got = %receipt.id, "Mismatched enrollment receipt");
                    last_error = Some(Error::protocol(
                        &protocol,
                        ProtocolErrorKind::Malformed("receipt for another user".to_string()),
                    ));
                }
                Err(e) => {
                    warn!(%addr, error = %e, "Enrollment attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(Error::Shutdown))
    }
}

#[async_trait]
impl VerificationDispatcher for NetworkDispatcher {
    async fn dispatch(&self, request: &VerificationRequest) -> Result<DispatchOutcome> {
        let query = VerifyRequest {
            request_id: request.id.clone(),
            subject_id: request.subject_id.clone(),
            criteria: request.criteria.clone(),
        };

        let mut unknown = None;
        let mut last_error = None;
        for addr in self.candidates().await? {
            let peer = split_peer_id(&addr).0;
            match self.ask(&addr, &query).await {
                Ok(outcome) if outcome.verdict == Verdict::UnknownSubject => {
                    debug!(peer = %outcome.peer_id, request_id = %request.id, "Peer does not hold subject");
                    unknown = Some(outcome);
                }
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(?peer, %addr, request_id = %request.id, error = %e, "Verification peer failed");
                    last_error = Some(e);
                }
            }
        }

        match (unknown, last_error) {
            (Some(outcome), _) => Ok(outcome),
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::Shutdown),
        }
    }
}
