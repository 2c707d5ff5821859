//! Built-in protocol handlers of a custody node.

use super::message::{
    self, DataBlock, NewUser, PrintMessage, ProtocolId, Receipt, UploadReceipt, UploadRequest,
    Verdict, VerifyRequest, VerifyResponse,
};
use super::{Multiplexer, ProtocolStream, StreamHandler};
use crate::cipher::{self, EnvelopeKey};
use crate::custody::{content_hash, CustodyStore};
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::event::{NodeEvent, NodeEventsSender};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Register every built-in handler on `mux`.
///
/// # Errors
///
/// [`ProtocolErrorKind::AlreadyRegistered`] if any of them is already taken.
pub fn register_defaults(mux: &Multiplexer, custody: &CustodyStore) -> Result<()> {
    let events = mux.node().events().clone();

    mux.register_handler(ProtocolId::builtin(message::PRINT), Arc::new(PrintHandler))?;
    mux.register_handler(ProtocolId::builtin(message::ECHO), Arc::new(EchoHandler))?;
    mux.register_handler(
        ProtocolId::builtin(message::NEW_USER),
        Arc::new(NewUserHandler {
            custody: custody.clone(),
            events: events.clone(),
        }),
    )?;
    mux.register_handler(
        ProtocolId::builtin(message::STORE),
        Arc::new(StoreHandler {
            custody: custody.clone(),
            events: events.clone(),
        }),
    )?;
    mux.register_handler(
        ProtocolId::builtin(message::UPLOAD),
        Arc::new(UploadHandler {
            custody: custody.clone(),
            mux: mux.clone(),
            events,
        }),
    )?;
    mux.register_handler(
        ProtocolId::builtin(message::VERIFY),
        Arc::new(VerifyHandler {
            custody: custody.clone(),
        }),
    )?;
    Ok(())
}

async fn blocking<T, F>(protocol: &ProtocolId, work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::protocol(protocol, ProtocolErrorKind::Io(e.to_string())))
}

/// Logs the message; no reply.
#[derive(Debug, Default)]
pub struct PrintHandler;

#[async_trait]
impl StreamHandler for PrintHandler {
    async fn handle(&self, stream: &mut ProtocolStream) -> Result<()> {
        let msg: PrintMessage = stream.read_message().await?;
        info!(peer = %stream.peer(), message = %msg.message, "Received print message");
        Ok(())
    }
}

/// Writes the request bytes back unchanged.
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl StreamHandler for EchoHandler {
    async fn handle(&self, stream: &mut ProtocolStream) -> Result<()> {
        let bytes = stream.read_to_end().await?;
        debug!(peer = %stream.peer(), len = bytes.len(), "Echoing");
        stream.write_all(&bytes).await?;
        stream.close().await
    }
}

/// Takes custody of a sealed user record.
#[derive(Debug)]
pub struct NewUserHandler {
    custody: CustodyStore,
    events: NodeEventsSender,
}

#[async_trait]
impl StreamHandler for NewUserHandler {
    async fn handle(&self, stream: &mut ProtocolStream) -> Result<()> {
        let msg: NewUser = stream.read_message().await?;
        self.custody.put_user(&msg)?;
        info!(peer = %stream.peer(), user_id = %msg.id, "Accepted user record");
        let _ = self.events.send(NodeEvent::UserEnrolled {
            user_id: msg.id.clone(),
        });
        stream.send_message(&Receipt { id: msg.id }).await
    }
}

/// Stores a replicated data block after an integrity check.
#[derive(Debug)]
pub struct StoreHandler {
    custody: CustodyStore,
    events: NodeEventsSender,
}

#[async_trait]
impl StreamHandler for StoreHandler {
    async fn handle(&self, stream: &mut ProtocolStream) -> Result<()> {
        let block: DataBlock = stream.read_message().await?;
        let custody = self.custody.clone();
        let checked = block.clone();
        blocking(stream.protocol(), move || custody.put_block(&checked)).await??;

        info!(peer = %stream.peer(), hash = %block.hash, "Stored data block");
        let _ = self.events.send(NodeEvent::DataStored {
            hash: block.hash.clone(),
        });
        stream.send_message(&Receipt { id: block.hash }).await
    }
}

/// Seals an uploaded payload, keeps it and replicates it to one random peer.
#[derive(Debug)]
pub struct UploadHandler {
    custody: CustodyStore,
    mux: Multiplexer,
    events: NodeEventsSender,
}

#[async_trait]
impl StreamHandler for UploadHandler {
    async fn handle(&self, stream: &mut ProtocolStream) -> Result<()> {
        let request: UploadRequest = stream.read_message().await?;
        let plaintext = STANDARD.decode(request.data.trim()).map_err(|e| {
            Error::protocol(stream.protocol(), ProtocolErrorKind::Malformed(e.to_string()))
        })?;

        let (key, envelope) = blocking(stream.protocol(), move || {
            let key = EnvelopeKey::generate();
            cipher::seal(&plaintext, &key).map(|envelope| (key, envelope))
        })
        .await??;

        let block = DataBlock {
            hash: content_hash(envelope.as_bytes()),
            cipher: envelope.to_base64(),
        };
        self.custody.put_block(&block)?;
        let _ = self.events.send(NodeEvent::DataStored {
            hash: block.hash.clone(),
        });

        self.replicate(stream.peer(), &block).await;

        stream
            .send_message(&UploadReceipt {
                hash: block.hash,
                key: key.to_base64(),
            })
            .await
    }
}

impl UploadHandler {
    async fn replicate(&self, uploader: libp2p::PeerId, block: &DataBlock) {
        let connections = match self.mux.node().connections().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Cannot list peers for replication");
                return;
            }
        };
        let candidates: Vec<_> = connections
            .into_iter()
            .filter(|c| c.peer_id() != uploader)
            .collect();
        let Some(target) = candidates.choose(&mut rand::thread_rng()).cloned() else {
            debug!(hash = %block.hash, "No peer to replicate to");
            return;
        };

        let store = ProtocolId::builtin(message::STORE);
        match self.mux.request::<_, Receipt>(&target, &store, block).await {
            Ok(receipt) => {
                info!(peer = %target.peer_id(), hash = %receipt.id, "Replicated data block");
            }
            Err(e) => {
                warn!(peer = %target.peer_id(), hash = %block.hash, error = %e, "Replication failed");
            }
        }
    }
}

/// Answers eligibility queries against custodied records.
#[derive(Debug)]
pub struct VerifyHandler {
    custody: CustodyStore,
}

#[async_trait]
impl StreamHandler for VerifyHandler {
    async fn handle(&self, stream: &mut ProtocolStream) -> Result<()> {
        let request: VerifyRequest = stream.read_message().await?;

        let verdict = match self.custody.user(&request.subject_id) {
            None => Verdict::UnknownSubject,
            Some(record) => {
                let criteria = request.criteria.clone();
                blocking(stream.protocol(), move || record.verdict(&criteria)).await?
            }
        };

        info!(
            peer = %stream.peer(),
            request_id = %request.request_id,
            %verdict,
            "Answered verification query"
        );
        stream
            .send_message(&VerifyResponse {
                request_id: request.request_id,
                verdict,
            })
            .await
    }
}
