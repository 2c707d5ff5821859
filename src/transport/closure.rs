//! Per-peer connection closure signals.
//!
//! Yamux keeps a stream open until both ends drop it, even while its
//! connection is being closed. Streams therefore also watch a signal that
//! the driver fires as soon as the connection to their peer goes away.

use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Default)]
pub(crate) struct ClosureSignals {
    senders: Arc<Mutex<HashMap<PeerId, watch::Sender<bool>>>>,
}

impl ClosureSignals {
    /// Receiver that flips to `true` once the current connection to `peer`
    /// closes. A later connection gets a fresh signal.
    pub(crate) fn subscribe(&self, peer: PeerId) -> ConnectionClosed {
        let mut senders = self.senders.lock();
        let sender = senders
            .entry(peer)
            .or_insert_with(|| watch::channel(false).0);
        ConnectionClosed(sender.subscribe())
    }

    pub(crate) fn fire(&self, peer: &PeerId) {
        if let Some(sender) = self.senders.lock().remove(peer) {
            sender.send_replace(true);
        }
    }

    pub(crate) fn fire_all(&self) {
        for (_, sender) in self.senders.lock().drain() {
            sender.send_replace(true);
        }
    }
}

/// Resolves once the connection a stream runs on has closed.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionClosed(watch::Receiver<bool>);

impl ConnectionClosed {
    pub(crate) async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}
