//! Node assembly: transport, protocol handlers, custody and the request
//! lifecycle wired around one [`NodeHandle`].

use crate::config::NodeConfig;
use crate::custody::CustodyStore;
use crate::error::{Error, Result};
use crate::event::{create_event_channel, NodeEvent, NodeEventsChannel, NodeEventsSender};
use crate::identity::PeerIdentity;
use crate::protocol::{handlers, Multiplexer};
use crate::request::{ConnectedPeers, NetworkDispatcher, PeerSource, RequestManager, StaticPeers};
use crate::store::{MemoryStore, RequestStore};
use crate::transport::{parse_multiaddr, NodeHandle};
use libp2p::{Multiaddr, PeerId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const BOOTSTRAP_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const BOOTSTRAP_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Builder for constructing a dsn node.
pub struct NodeBuilder {
    config: NodeConfig,
    identity: Option<PeerIdentity>,
    store: Option<Arc<dyn RequestStore>>,
    peers: Option<Arc<dyn PeerSource>>,
}

impl NodeBuilder {
    /// Create a new node builder with the given configuration.
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            identity: None,
            store: None,
            peers: None,
        }
    }

    /// Use this identity instead of the configured one.
    #[must_use]
    pub fn with_identity(mut self, identity: PeerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Persist requests in `store` instead of memory.
    #[must_use]
    pub fn with_request_store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Source verification peers from `peers` instead of configuration.
    #[must_use]
    pub fn with_peer_source(mut self, peers: Arc<dyn PeerSource>) -> Self {
        self.peers = Some(peers);
        self
    }

    fn resolve_identity(&self) -> Result<PeerIdentity> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        if let Some(seed) = &self.config.identity.seed {
            warn!("Deriving node identity from a seed; do not use outside test networks");
            return PeerIdentity::from_seed(seed);
        }
        PeerIdentity::load_or_generate(&self.config.key_path())
    }

    /// Build and start the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity cannot be loaded, an address is
    /// invalid, or any listen address cannot be bound.
    pub async fn build(self) -> Result<RunningNode> {
        info!("Building dsn-node with config: {:?}", self.config);

        std::fs::create_dir_all(&self.config.root_dir)?;

        let identity = self.resolve_identity()?;
        let bootstrap = self
            .config
            .network
            .bootstrap
            .iter()
            .map(|s| parse_multiaddr(s))
            .collect::<Result<Vec<_>>>()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();

        let handle =
            NodeHandle::start_with_events(&self.config.network, Some(identity), events_tx.clone())
                .await?;

        let mux = Multiplexer::new(handle.clone());
        let custody = CustodyStore::new();
        if let Err(e) = handlers::register_defaults(&mux, &custody) {
            let _ = handle.shutdown().await;
            return Err(e);
        }

        let peers: Arc<dyn PeerSource> = match self.peers {
            Some(peers) => peers,
            None if self.config.verification.peers.is_empty() => {
                Arc::new(ConnectedPeers::new(handle.clone()))
            }
            None => Arc::new(StaticPeers::parse(&self.config.verification.peers)?),
        };
        let dispatcher = Arc::new(NetworkDispatcher::new(mux.clone(), peers));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let requests = RequestManager::new(store, dispatcher.clone()).with_events(events_tx.clone());

        info!(peer_id = %handle.local_peer_id(), "Node built");

        Ok(RunningNode {
            config: self.config,
            handle,
            mux,
            custody,
            requests,
            dispatcher,
            bootstrap,
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

/// A running dsn node.
pub struct RunningNode {
    config: NodeConfig,
    handle: NodeHandle,
    mux: Multiplexer,
    custody: CustodyStore,
    requests: RequestManager,
    dispatcher: Arc<NetworkDispatcher>,
    bootstrap: Vec<Multiaddr>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: NodeEventsSender,
    events_rx: Option<NodeEventsChannel>,
}

impl RunningNode {
    /// Get the node's root directory.
    #[must_use]
    pub fn root_dir(&self) -> &PathBuf {
        &self.config.root_dir
    }

    /// This node's peer id.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.handle.local_peer_id()
    }

    /// Transport handle.
    #[must_use]
    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    /// Protocol multiplexer.
    #[must_use]
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Records held in custody by this node.
    #[must_use]
    pub fn custody(&self) -> &CustodyStore {
        &self.custody
    }

    /// Request lifecycle manager.
    #[must_use]
    pub fn requests(&self) -> &RequestManager {
        &self.requests
    }

    /// Network dispatcher, also used to enroll user records.
    #[must_use]
    pub fn dispatcher(&self) -> &NetworkDispatcher {
        &self.dispatcher
    }

    /// Get a receiver for node events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<NodeEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to node events.
    #[must_use]
    pub fn subscribe_events(&self) -> NodeEventsChannel {
        self.events_tx.subscribe()
    }

    /// Start dialing bootstrap peers in the background.
    pub fn start_bootstrap(&self) {
        for addr in &self.bootstrap {
            tokio::spawn(bootstrap_peer(
                self.handle.clone(),
                addr.clone(),
                self.shutdown_rx.clone(),
            ));
        }
    }

    /// Run the node until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the node encounters a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        info!(peer_id = %self.peer_id(), "Starting dsn-node");

        let _ = self.events_tx.send(NodeEvent::Started);
        for addr in self.handle.dialable_addrs() {
            let _ = self.events_tx.send(NodeEvent::ListeningOn {
                address: addr.to_string(),
            });
        }
        self.start_bootstrap();

        info!("Node running, waiting for shutdown signal");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    self.shutdown();
                    break;
                }
            }
        }

        self.stop().await?;
        info!("Node shutdown complete");
        Ok(())
    }

    /// Request the node to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal shutdown and stop the transport.
    ///
    /// # Errors
    ///
    /// Propagates transport shutdown errors.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown();
        let _ = self.events_tx.send(NodeEvent::ShuttingDown);
        self.handle.shutdown().await
    }
}

/// Keep a connection to one bootstrap peer: dial with backoff, and dial
/// again whenever the peer disconnects.
async fn bootstrap_peer(handle: NodeHandle, addr: Multiaddr, mut shutdown: watch::Receiver<bool>) {
    let mut delay = BOOTSTRAP_INITIAL_BACKOFF;
    loop {
        // Subscribe before dialing so a disconnect right after is not missed.
        let mut events = handle.subscribe();
        match handle.dial(&addr).await {
            Ok(connection) => {
                let peer = connection.peer_id();
                info!(%peer, %addr, "Connected to bootstrap peer");
                delay = BOOTSTRAP_INITIAL_BACKOFF;
                if !wait_for_disconnect(&handle, peer, &mut events, &mut shutdown).await {
                    return;
                }
                info!(%peer, %addr, "Bootstrap peer disconnected, reconnecting");
            }
            Err(Error::Shutdown) => return,
            Err(e) if !e.is_retryable() => {
                warn!(%addr, error = %e, "Giving up on bootstrap peer");
                return;
            }
            Err(e) => {
                debug!(%addr, error = %e, retry_in = ?delay, "Bootstrap dial failed");
            }
        }

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
        delay = (delay * 2).min(BOOTSTRAP_MAX_BACKOFF);
    }
}

/// Wait until `peer` has no connection left. Returns `false` on shutdown.
async fn wait_for_disconnect(
    handle: &NodeHandle,
    peer: PeerId,
    events: &mut NodeEventsChannel,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let peer_id = peer.to_string();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(NodeEvent::PeerDisconnected { peer_id: gone }) if gone == peer_id => return true,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => match handle.connection_count(&peer).await {
                    Ok(0) => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                },
                Err(RecvError::Closed) => return false,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
