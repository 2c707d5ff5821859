//! Cloneable handle to a running transport.

use super::address::{split_peer_id, with_peer_id};
use super::behaviour::{build_swarm, NodeBehaviour, SwarmSettings};
use super::closure::{ClosureSignals, ConnectionClosed};
use super::driver::{Command, SwarmDriver};
use super::metrics::NetworkMetrics;
use super::{parse_multiaddr, Connection};
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::event::{create_event_channel, NodeEventsChannel, NodeEventsSender};
use crate::identity::PeerIdentity;
use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, Swarm};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const COMMAND_BUFFER: usize = 256;

/// Handle to a running node's transport.
///
/// Cheap to clone; every clone talks to the same swarm driver task. The
/// handle is passed explicitly to every component that needs the network.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<Inner>,
}

struct Inner {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    closures: ClosureSignals,
    events: NodeEventsSender,
    config: NetworkConfig,
    started_at: Instant,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl NodeHandle {
    /// Start the transport: bind every listen address and spawn the driver.
    ///
    /// If `identity` is `None` a fresh one is generated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] for an unparsable listen address and
    /// [`Error::Transport`] if any address cannot be bound. Nothing is left
    /// running on error.
    pub async fn start(config: &NetworkConfig, identity: Option<PeerIdentity>) -> Result<Self> {
        let (events, _) = create_event_channel();
        Self::start_with_events(config, identity, events).await
    }

    pub(crate) async fn start_with_events(
        config: &NetworkConfig,
        identity: Option<PeerIdentity>,
        events: NodeEventsSender,
    ) -> Result<Self> {
        let identity = identity.unwrap_or_else(PeerIdentity::generate);
        let listen = config
            .listen
            .iter()
            .map(|s| parse_multiaddr(s))
            .collect::<Result<Vec<_>>>()?;

        let settings = SwarmSettings {
            idle_timeout: config.idle_connection_timeout(),
            ping_interval: config.ping_interval(),
        };
        let mut swarm = build_swarm(&identity, settings)?;
        let control = swarm.behaviour().stream.new_control();

        let mut listeners = HashSet::new();
        for addr in &listen {
            let id = swarm
                .listen_on(addr.clone())
                .map_err(|e| Error::Transport(format!("failed to listen on {addr}: {e}")))?;
            listeners.insert(id);
        }
        let bound = await_listeners(&mut swarm, listeners, config.dial_timeout()).await?;
        for addr in &bound {
            info!(address = %with_peer_id(addr, identity.peer_id()), "Listening");
        }

        let listen_addrs = Arc::new(RwLock::new(bound));
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let closures = ClosureSignals::default();
        let driver = SwarmDriver::new(
            swarm,
            rx,
            events.clone(),
            Arc::clone(&listen_addrs),
            closures.clone(),
        );
        let task = tokio::spawn(driver.run());

        Ok(Self {
            inner: Arc::new(Inner {
                local_peer_id: identity.peer_id(),
                commands: tx,
                control,
                listen_addrs,
                closures,
                events,
                config: config.clone(),
                started_at: Instant::now(),
                driver: Mutex::new(Some(task)),
            }),
        })
    }

    /// This node's peer id.
    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id
    }

    /// Addresses currently bound, without the `/p2p/` suffix.
    #[must_use]
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.listen_addrs.read().clone()
    }

    /// Listen addresses with this node's `/p2p/` suffix, ready to hand to a
    /// remote dialer.
    #[must_use]
    pub fn dialable_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs()
            .iter()
            .map(|a| with_peer_id(a, self.inner.local_peer_id))
            .collect()
    }

    /// Network settings the transport was started with.
    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Subscribe to node events.
    #[must_use]
    pub fn subscribe(&self) -> NodeEventsChannel {
        self.inner.events.subscribe()
    }

    pub(crate) fn events(&self) -> &NodeEventsSender {
        &self.inner.events
    }

    pub(crate) fn stream_control(&self) -> libp2p_stream::Control {
        self.inner.control.clone()
    }

    pub(crate) fn closures(&self) -> &ClosureSignals {
        &self.inner.closures
    }

    pub(crate) fn connection_closed(&self, peer: PeerId) -> ConnectionClosed {
        self.inner.closures.subscribe(peer)
    }

    /// Parse `address` and dial it.
    ///
    /// # Errors
    ///
    /// See [`NodeHandle::dial`]; also [`Error::InvalidAddress`].
    pub async fn connect(&self, address: &str) -> Result<Connection> {
        let addr = parse_multiaddr(address)?;
        self.dial(&addr).await
    }

    /// Dial `address` with the configured dial timeout.
    ///
    /// If the address carries a `/p2p/` suffix and that peer is already
    /// connected, or being dialed, the existing outcome is shared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dial`] when the peer is unreachable or the dial times
    /// out, and [`Error::Handshake`] when authentication fails.
    pub async fn dial(&self, address: &Multiaddr) -> Result<Connection> {
        self.dial_with_timeout(address, self.inner.config.dial_timeout())
            .await
    }

    /// Dial `address`, giving up after `timeout`.
    ///
    /// On timeout the in-flight dial is aborted unless another caller is
    /// still waiting on it.
    ///
    /// # Errors
    ///
    /// See [`NodeHandle::dial`].
    pub async fn dial_with_timeout(
        &self,
        address: &Multiaddr,
        timeout: Duration,
    ) -> Result<Connection> {
        let (peer, bare) = split_peer_id(address);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial {
            peer,
            address: bare,
            reply,
        })
        .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => {
                debug!(%address, ?timeout, "Dial timed out");
                // The receiver is dropped here, so the driver sees this caller gone.
                let _ = self.inner.commands.send(Command::PruneDials).await;
                Err(Error::Dial {
                    target: address.to_string(),
                    reason: format!("timed out after {timeout:?}"),
                })
            }
        }
    }

    /// Close a connection. Streams on it observe closure promptly.
    ///
    /// Returns `false` if the connection was already gone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the node has stopped.
    pub async fn close(&self, connection: &Connection) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Close {
            connection_id: connection.connection_id(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Number of live connections to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the node has stopped.
    pub async fn connection_count(&self, peer: &PeerId) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConnectionCount { peer: *peer, reply })
            .await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// The connection streams to each connected peer are opened on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the node has stopped.
    pub async fn connections(&self) -> Result<Vec<Connection>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connections { reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Peers with at least one live connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the node has stopped.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        Ok(self
            .connections()
            .await?
            .iter()
            .map(Connection::peer_id)
            .collect())
    }

    /// Connected peers with direction, age and ping latency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the node has stopped.
    pub async fn metrics(&self) -> Result<NetworkMetrics> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Metrics { reply }).await?;
        let peers = rx.await.map_err(|_| Error::Shutdown)?;
        Ok(NetworkMetrics {
            local_peer_id: self.inner.local_peer_id,
            uptime: self.inner.started_at.elapsed(),
            peers,
        })
    }

    /// Whether the driver task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.commands.is_closed()
    }

    /// Stop the driver, closing every connection and listener. Idempotent.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for drain failures.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .commands
            .send(Command::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }

        let task = self.inner.driver.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!(peer_id = %self.inner.local_peer_id, "Transport shut down");
        }
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| Error::Shutdown)
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("local_peer_id", &self.inner.local_peer_id)
            .field("listen_addrs", &*self.inner.listen_addrs.read())
            .finish_non_exhaustive()
    }
}

/// Drive the swarm until every listener has reported an address.
async fn await_listeners(
    swarm: &mut Swarm<NodeBehaviour>,
    mut pending: HashSet<ListenerId>,
    timeout: Duration,
) -> Result<Vec<Multiaddr>> {
    let mut bound = Vec::new();
    let wait = async {
        while !pending.is_empty() {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr {
                    listener_id,
                    address,
                } => {
                    pending.remove(&listener_id);
                    if !bound.contains(&address) {
                        bound.push(address);
                    }
                }
                SwarmEvent::ListenerClosed {
                    listener_id,
                    reason,
                    ..
                } if pending.contains(&listener_id) => {
                    let reason = match reason {
                        Ok(()) => "listener closed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    return Err(Error::Transport(reason));
                }
                SwarmEvent::ListenerError { listener_id, error } if pending.contains(&listener_id) => {
                    return Err(Error::Transport(error.to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::Transport("timed out binding listen addresses".to_string()))??;
    Ok(bound)
}
