//! A negotiated stream carrying one request and one response.
//!
//! Each direction carries a single message terminated by the writer's
//! half-close. Closing the local write side never prevents draining what the
//! remote still has to send. Every read and write also ends as soon as the
//! connection underneath is closed.

use super::message::{decode, encode, ProtocolId};
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::transport::closure::ConnectionClosed;
use futures::{AsyncReadExt, AsyncWriteExt};
use libp2p::PeerId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::time::Duration;

/// Per-stream limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamLimits {
    pub(crate) max_message_bytes: usize,
    pub(crate) timeout: Duration,
}

/// A stream bound to one protocol and one remote peer.
pub struct ProtocolStream {
    inner: libp2p::Stream,
    peer: PeerId,
    protocol: ProtocolId,
    limits: StreamLimits,
    closed: ConnectionClosed,
    write_closed: bool,
}

impl ProtocolStream {
    pub(crate) fn new(
        inner: libp2p::Stream,
        peer: PeerId,
        protocol: ProtocolId,
        limits: StreamLimits,
        closed: ConnectionClosed,
    ) -> Self {
        Self {
            inner,
            peer,
            protocol,
            limits,
            closed,
            write_closed: false,
        }
    }

    /// Remote peer.
    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Negotiated protocol.
    #[must_use]
    pub fn protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    /// Read everything until the remote half-closes.
    ///
    /// # Errors
    ///
    /// [`ProtocolErrorKind::Malformed`] if the message exceeds the size limit,
    /// [`ProtocolErrorKind::Timeout`] if the remote never finishes, and
    /// [`ProtocolErrorKind::Io`] if the stream or its connection fails.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let max = self.limits.max_message_bytes;
        let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
        let mut buf = Vec::new();

        let mut reader = (&mut self.inner).take(limit);
        let read = reader.read_to_end(&mut buf);
        if let Err(kind) = guarded(&mut self.closed, self.limits.timeout, read).await {
            return Err(self.error(kind));
        }

        if buf.len() > max {
            return Err(self.error(ProtocolErrorKind::Malformed(format!(
                "message exceeds {max} bytes"
            ))));
        }
        Ok(buf)
    }

    /// Write `bytes` and flush.
    ///
    /// # Errors
    ///
    /// Fails if the local write side is already closed or the write fails.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if self.write_closed {
            return Err(self.error(ProtocolErrorKind::Io("write side closed".to_string())));
        }
        if bytes.len() > self.limits.max_message_bytes {
            return Err(self.error(ProtocolErrorKind::Malformed(format!(
                "message exceeds {} bytes",
                self.limits.max_message_bytes
            ))));
        }

        let inner = &mut self.inner;
        let write = async move {
            inner.write_all(bytes).await?;
            inner.flush().await
        };
        guarded(&mut self.closed, self.limits.timeout, write)
            .await
            .map_err(|kind| self.error(kind))
    }

    /// Half-close the local write side, signalling end of message. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails if the close cannot be delivered.
    pub async fn close(&mut self) -> Result<()> {
        if self.write_closed {
            return Ok(());
        }
        self.write_closed = true;
        let close = self.inner.close();
        guarded(&mut self.closed, self.limits.timeout, close)
            .await
            .map_err(|kind| self.error(kind))
    }

    /// Whether the local write side has been closed.
    #[must_use]
    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    /// Read and decode the remote's whole message.
    ///
    /// # Errors
    ///
    /// See [`ProtocolStream::read_to_end`]; decoding failures are `Malformed`.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_to_end().await?;
        decode(&self.protocol, &bytes)
    }

    /// Encode, write and half-close.
    ///
    /// # Errors
    ///
    /// See [`ProtocolStream::write_all`].
    pub async fn send_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = encode(message)?;
        self.write_all(&bytes).await?;
        self.close().await
    }

    fn error(&self, kind: ProtocolErrorKind) -> Error {
        Error::protocol(&self.protocol, kind)
    }
}

/// Run one stream operation bounded by `limit` and by the connection's
/// lifetime. Once the connection is closed no operation succeeds.
async fn guarded<T>(
    closed: &mut ConnectionClosed,
    limit: Duration,
    op: impl Future<Output = io::Result<T>>,
) -> std::result::Result<T, ProtocolErrorKind> {
    tokio::select! {
        biased;
        () = closed.wait() => Err(ProtocolErrorKind::Io("connection closed".to_string())),
        outcome = tokio::time::timeout(limit, op) => match outcome {
            Err(_) => Err(ProtocolErrorKind::Timeout),
            Ok(Err(e)) => Err(ProtocolErrorKind::Io(e.to_string())),
            Ok(Ok(value)) => Ok(value),
        },
    }
}

impl std::fmt::Debug for ProtocolStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("write_closed", &self.write_closed)
            .finish_non_exhaustive()
    }
}
