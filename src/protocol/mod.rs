//! Protocol multiplexer.
//!
//! Named, versioned application protocols run as independent streams over a
//! peer connection. Inbound streams are routed to the handler registered for
//! their protocol, each on its own task; outbound exchanges go through
//! [`Multiplexer::open_stream`] or the [`Multiplexer::send_and_close`]
//! combinator.

pub mod handlers;
pub mod message;
mod stream;

pub use message::ProtocolId;
pub use stream::ProtocolStream;

use crate::error::{Error, ProtocolErrorKind, Result};
use crate::transport::{Connection, NodeHandle};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use libp2p_stream::OpenStreamError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use stream::StreamLimits;
use tracing::{debug, warn};

/// Callback for inbound streams of one protocol.
///
/// A handler should consume the request before returning. The stream is
/// closed by the multiplexer afterwards if the handler has not done so.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Serve one inbound stream.
    async fn handle(&self, stream: &mut ProtocolStream) -> Result<()>;
}

/// Result of [`Multiplexer::send_and_close`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Payload bytes written before the half-close.
    pub bytes_sent: usize,
    /// The remote's reply, when one was awaited.
    pub response: Option<Bytes>,
}

/// Registers protocol handlers and opens outbound streams on a node.
#[derive(Clone, Debug)]
pub struct Multiplexer {
    node: NodeHandle,
}

impl Multiplexer {
    /// Multiplexer over `node`'s connections.
    #[must_use]
    pub fn new(node: NodeHandle) -> Self {
        Self { node }
    }

    /// The underlying node handle.
    #[must_use]
    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    fn limits(&self) -> StreamLimits {
        let config = self.node.config();
        StreamLimits {
            max_message_bytes: config.max_message_bytes,
            timeout: config.stream_timeout(),
        }
    }

    /// Route inbound streams negotiated for `protocol` to `handler`.
    ///
    /// # Errors
    ///
    /// [`ProtocolErrorKind::AlreadyRegistered`] if the protocol already has a
    /// handler on this node.
    pub fn register_handler(
        &self,
        protocol: ProtocolId,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<()> {
        let mut control = self.node.stream_control();
        let mut incoming = control
            .accept(protocol.stream_protocol())
            .map_err(|_| Error::protocol(&protocol, ProtocolErrorKind::AlreadyRegistered))?;
        let limits = self.limits();
        let closures = self.node.closures().clone();
        debug!(%protocol, "Registered protocol handler");

        tokio::spawn(async move {
            while let Some((peer, raw)) = incoming.next().await {
                let handler = Arc::clone(&handler);
                let closed = closures.subscribe(peer);
                let mut stream = ProtocolStream::new(raw, peer, protocol.clone(), limits, closed);
                tokio::spawn(async move {
                    debug!(%peer, protocol = %stream.protocol(), "Inbound stream");
                    if let Err(e) = handler.handle(&mut stream).await {
                        warn!(%peer, protocol = %stream.protocol(), error = %e, "Handler failed");
                    }
                    if let Err(e) = stream.close().await {
                        debug!(%peer, error = %e, "Closing inbound stream failed");
                    }
                });
            }
            debug!(%protocol, "Protocol handler stopped");
        });

        Ok(())
    }

    /// Open a stream to the connection's peer and negotiate `protocol`.
    ///
    /// # Errors
    ///
    /// [`ProtocolErrorKind::UnsupportedProtocol`] if the remote does not speak
    /// `protocol`, [`ProtocolErrorKind::Timeout`] if negotiation exceeds the
    /// stream timeout, [`ProtocolErrorKind::Io`] otherwise.
    pub async fn open_stream(
        &self,
        connection: &Connection,
        protocol: &ProtocolId,
    ) -> Result<ProtocolStream> {
        let limits = self.limits();
        let peer = connection.peer_id();
        let mut control = self.node.stream_control();
        let closed = self.node.connection_closed(peer);

        let open = control.open_stream(peer, protocol.stream_protocol());
        let raw = match tokio::time::timeout(limits.timeout, open).await {
            Err(_) => return Err(Error::protocol(protocol, ProtocolErrorKind::Timeout)),
            Ok(Err(OpenStreamError::UnsupportedProtocol(_))) => {
                return Err(Error::protocol(
                    protocol,
                    ProtocolErrorKind::UnsupportedProtocol,
                ))
            }
            Ok(Err(e)) => {
                return Err(Error::protocol(
                    protocol,
                    ProtocolErrorKind::Io(e.to_string()),
                ))
            }
            Ok(Ok(raw)) => raw,
        };

        Ok(ProtocolStream::new(raw, peer, protocol.clone(), limits, closed))
    }

    /// Open a stream, write `payload`, half-close, optionally read the reply,
    /// then close.
    ///
    /// # Errors
    ///
    /// Any error from [`Multiplexer::open_stream`] or the exchange.
    pub async fn send_and_close(
        &self,
        connection: &Connection,
        protocol: &ProtocolId,
        payload: &[u8],
        await_response: bool,
    ) -> Result<Ack> {
        let mut stream = self.open_stream(connection, protocol).await?;
        stream.write_all(payload).await?;
        stream.close().await?;

        let response = if await_response {
            Some(Bytes::from(stream.read_to_end().await?))
        } else {
            None
        };

        Ok(Ack {
            bytes_sent: payload.len(),
            response,
        })
    }

    /// Send a typed message and decode the typed reply.
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::send_and_close`]; an unparsable reply is `Malformed`.
    pub async fn request<Req, Resp>(
        &self,
        connection: &Connection,
        protocol: &ProtocolId,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = message::encode(request)?;
        let ack = self
            .send_and_close(connection, protocol, &payload, true)
            .await?;
        let response = ack.response.unwrap_or_default();
        message::decode(protocol, &response)
    }

    /// Send a typed message with no reply.
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::send_and_close`].
    pub async fn notify<Req: Serialize + Sync>(
        &self,
        connection: &Connection,
        protocol: &ProtocolId,
        request: &Req,
    ) -> Result<Ack> {
        let payload = message::encode(request)?;
        self.send_and_close(connection, protocol, &payload, false)
            .await
    }
}
