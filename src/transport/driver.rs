//! Swarm driver task.
//!
//! The swarm and the live connection table are owned by a single task.
//! Every mutation (dials, accepts, closes, shutdown) arrives either as a
//! [`Command`] from a [`NodeHandle`](super::NodeHandle) or as a swarm event,
//! so access is serialized without locks.

use super::behaviour::{NodeBehaviour, NodeBehaviourEvent};
use super::closure::ClosureSignals;
use super::metrics::{Direction, PeerMetrics};
use super::Connection;
use crate::error::{Error, Result};
use crate::event::{NodeEvent, NodeEventsSender};
use crate::transport::address::with_peer_id;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use libp2p::core::transport::TransportError;
use libp2p::core::upgrade::NegotiationError;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, DialError, SwarmEvent};
use libp2p::{identify, noise, ping, Multiaddr, PeerId, Swarm};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Consecutive failed pings after which a connection is considered dead.
const MAX_PING_FAILURES: u32 = 3;

type DialReply = oneshot::Sender<Result<Connection>>;

/// Requests sent from handles to the driver.
pub(crate) enum Command {
    Dial {
        peer: Option<PeerId>,
        address: Multiaddr,
        reply: DialReply,
    },
    /// Abandon in-flight dials whose callers have all gone away.
    PruneDials,
    Close {
        connection_id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    ConnectionCount {
        peer: PeerId,
        reply: oneshot::Sender<usize>,
    },
    Connections {
        reply: oneshot::Sender<Vec<Connection>>,
    },
    Metrics {
        reply: oneshot::Sender<Vec<PeerMetrics>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// How a failed dial should be reported.
#[derive(Debug, Clone)]
struct DialFailure {
    target: String,
    reason: String,
    handshake: bool,
}

impl DialFailure {
    fn from_swarm(target: String, error: &DialError) -> Self {
        Self {
            target,
            reason: error.to_string(),
            handshake: is_handshake_failure(error),
        }
    }

    fn to_error(&self) -> Error {
        if self.handshake {
            Error::Handshake {
                target: self.target.clone(),
                reason: self.reason.clone(),
            }
        } else {
            Error::Dial {
                target: self.target.clone(),
                reason: self.reason.clone(),
            }
        }
    }
}

/// Whether the remote was reached but could not be authenticated.
fn is_handshake_failure(error: &DialError) -> bool {
    match error {
        DialError::WrongPeerId { .. } | DialError::LocalPeerId { .. } | DialError::Denied { .. } => {
            true
        }
        DialError::Transport(attempts) => {
            !attempts.is_empty()
                && attempts.iter().all(|(_, e)| match e {
                    TransportError::Other(e) => upgrade_failed(e),
                    TransportError::MultiaddrNotSupported(_) => false,
                })
        }
        _ => false,
    }
}

/// Whether a transport error came out of protocol negotiation or the Noise
/// handshake rather than the TCP connect or a timeout.
fn upgrade_failed(error: &std::io::Error) -> bool {
    let mut current = error
        .get_ref()
        .map(|e| e as &(dyn std::error::Error + 'static));
    while let Some(e) = current {
        if e.is::<noise::Error>() || e.is::<NegotiationError>() {
            return true;
        }
        current = e.source();
    }
    false
}

struct PendingDial {
    target: String,
    /// `None` when we piggybacked on a dial the swarm was already running.
    connection_id: Option<ConnectionId>,
    waiters: Vec<DialReply>,
}

impl PendingDial {
    fn fail(self, failure: &DialFailure) {
        for waiter in self.waiters {
            let _ = waiter.send(Err(failure.to_error()));
        }
    }

    fn succeed(self, connection: &Connection) {
        for waiter in self.waiters {
            let _ = waiter.send(Ok(connection.clone()));
        }
    }
}

#[derive(Debug, Clone)]
struct LiveConnection {
    connection_id: ConnectionId,
    remote_addr: Multiaddr,
    dialer: PeerId,
    connected_since: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PeerHealth {
    latency: Option<Duration>,
    failures: u32,
}

pub(crate) struct SwarmDriver {
    swarm: Swarm<NodeBehaviour>,
    local_peer_id: PeerId,
    commands: mpsc::Receiver<Command>,
    events: NodeEventsSender,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    /// Index 0 is the connection streams are opened on; any others are
    /// redundant and already being closed.
    live: HashMap<PeerId, Vec<LiveConnection>>,
    pending_by_peer: HashMap<PeerId, PendingDial>,
    pending_unknown: HashMap<ConnectionId, PendingDial>,
    /// In-flight dials without a peer id, by dialed address.
    pending_by_addr: HashMap<Multiaddr, ConnectionId>,
    aborted: HashSet<ConnectionId>,
    closures: ClosureSignals,
    health: HashMap<PeerId, PeerHealth>,
}

impl SwarmDriver {
    pub(crate) fn new(
        swarm: Swarm<NodeBehaviour>,
        commands: mpsc::Receiver<Command>,
        events: NodeEventsSender,
        listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
        closures: ClosureSignals,
    ) -> Self {
        let local_peer_id = *swarm.local_peer_id();
        Self {
            swarm,
            local_peer_id,
            commands,
            events,
            listen_addrs,
            live: HashMap::new(),
            pending_by_peer: HashMap::new(),
            pending_unknown: HashMap::new(),
            pending_by_addr: HashMap::new(),
            aborted: HashSet::new(),
            closures,
            health: HashMap::new(),
        }
    }

    /// Run until a shutdown command arrives or every handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }

        let failure = DialFailure {
            target: "*".to_string(),
            reason: "node shutting down".to_string(),
            handshake: false,
        };
        for (_, pending) in self.pending_by_peer.drain() {
            pending.fail(&failure);
        }
        for (_, pending) in self.pending_unknown.drain() {
            pending.fail(&failure);
        }
        self.pending_by_addr.clear();
        self.listen_addrs.write().clear();
        self.closures.fire_all();

        let peers: Vec<PeerId> = self.live.keys().copied().collect();
        for peer in peers {
            let _ = self.swarm.disconnect_peer_id(peer);
        }
        drop(self.swarm);
        info!("Swarm driver stopped");

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial {
                peer,
                address,
                reply,
            } => self.dial(peer, address, reply),
            Command::PruneDials => self.prune_dials(),
            Command::Close {
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.close(connection_id));
            }
            Command::ConnectionCount { peer, reply } => {
                let count = self.live.get(&peer).map_or(0, Vec::len);
                let _ = reply.send(count);
            }
            Command::Connections { reply } => {
                let connections = self
                    .live
                    .keys()
                    .filter_map(|peer| self.primary(*peer))
                    .collect();
                let _ = reply.send(connections);
            }
            Command::Metrics { reply } => {
                let _ = reply.send(self.peer_metrics());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn primary(&self, peer: PeerId) -> Option<Connection> {
        self.live
            .get(&peer)
            .and_then(|conns| conns.first())
            .map(|c| Connection {
                peer_id: peer,
                connection_id: c.connection_id,
                remote_addr: c.remote_addr.clone(),
            })
    }

    fn peer_metrics(&self) -> Vec<PeerMetrics> {
        let mut peers: Vec<PeerMetrics> = self
            .live
            .iter()
            .filter_map(|(peer, conns)| {
                let primary = conns.first()?;
                let health = self.health.get(peer);
                Some(PeerMetrics {
                    peer_id: *peer,
                    address: primary.remote_addr.clone(),
                    direction: if primary.dialer == self.local_peer_id {
                        Direction::Outbound
                    } else {
                        Direction::Inbound
                    },
                    connected_since: primary.connected_since,
                    latency: health.and_then(|h| h.latency),
                    ping_failures: health.map_or(0, |h| h.failures),
                })
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Start closing `connection_id`. Streams on a peer's primary connection
    /// are told immediately instead of when the close completes.
    fn close(&mut self, connection_id: ConnectionId) -> bool {
        let primary_of = self.live.iter().find_map(|(peer, conns)| {
            conns
                .first()
                .filter(|c| c.connection_id == connection_id)
                .map(|_| *peer)
        });
        if let Some(peer) = primary_of {
            self.closures.fire(&peer);
        }
        self.swarm.close_connection(connection_id)
    }

    fn dial(&mut self, peer: Option<PeerId>, address: Multiaddr, reply: DialReply) {
        let Some(peer) = peer else {
            self.dial_unknown(address, reply);
            return;
        };

        let target = with_peer_id(&address, peer).to_string();
        if peer == self.local_peer_id {
            let _ = reply.send(Err(Error::Dial {
                target,
                reason: "refusing to dial the local peer".to_string(),
            }));
            return;
        }

        if let Some(existing) = self.primary(peer) {
            debug!(%peer, "Reusing existing connection");
            let _ = reply.send(Ok(existing));
            return;
        }

        if let Some(pending) = self.pending_by_peer.get_mut(&peer) {
            debug!(%peer, "Joining in-flight dial");
            pending.waiters.push(reply);
            return;
        }

        let opts = DialOpts::peer_id(peer)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .addresses(vec![address])
            .build();
        let connection_id = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                debug!(%peer, ?connection_id, "Dialing");
                self.pending_by_peer.insert(
                    peer,
                    PendingDial {
                        target,
                        connection_id: Some(connection_id),
                        waiters: vec![reply],
                    },
                );
            }
            Err(DialError::DialPeerConditionFalse(_)) => {
                // Something else inside the swarm is already dialing this peer.
                self.pending_by_peer.insert(
                    peer,
                    PendingDial {
                        target,
                        connection_id: None,
                        waiters: vec![reply],
                    },
                );
            }
            Err(e) => {
                let failure = DialFailure::from_swarm(target, &e);
                warn!(%peer, error = %e, "Dial rejected");
                let _ = reply.send(Err(failure.to_error()));
            }
        }
    }

    fn dial_unknown(&mut self, address: Multiaddr, reply: DialReply) {
        let target = address.to_string();

        let existing = self.live.iter().find_map(|(peer, conns)| {
            conns
                .iter()
                .any(|c| c.dialer == self.local_peer_id && c.remote_addr == address)
                .then_some(*peer)
        });
        if let Some(connection) = existing.and_then(|peer| self.primary(peer)) {
            debug!(%target, "Reusing existing connection");
            let _ = reply.send(Ok(connection));
            return;
        }

        if let Some(pending) = self
            .pending_by_addr
            .get(&address)
            .and_then(|id| self.pending_unknown.get_mut(id))
        {
            debug!(%target, "Joining in-flight dial");
            pending.waiters.push(reply);
            return;
        }

        let opts = DialOpts::unknown_peer_id().address(address.clone()).build();
        let connection_id = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                debug!(%target, ?connection_id, "Dialing address");
                self.pending_by_addr.insert(address, connection_id);
                self.pending_unknown.insert(
                    connection_id,
                    PendingDial {
                        target,
                        connection_id: Some(connection_id),
                        waiters: vec![reply],
                    },
                );
            }
            Err(e) => {
                warn!(%target, error = %e, "Dial rejected");
                let _ = reply.send(Err(DialFailure::from_swarm(target, &e).to_error()));
            }
        }
    }

    fn prune_dials(&mut self) {
        let mut abandoned_peers = Vec::new();
        for (peer, pending) in &mut self.pending_by_peer {
            pending.waiters.retain(|w| !w.is_closed());
            if pending.waiters.is_empty() {
                abandoned_peers.push(*peer);
            }
        }
        for peer in abandoned_peers {
            if let Some(pending) = self.pending_by_peer.remove(&peer) {
                debug!(%peer, "Aborting abandoned dial");
                if let Some(id) = pending.connection_id {
                    self.aborted.insert(id);
                }
                let _ = self.swarm.disconnect_peer_id(peer);
            }
        }

        let mut abandoned = Vec::new();
        for (id, pending) in &mut self.pending_unknown {
            pending.waiters.retain(|w| !w.is_closed());
            if pending.waiters.is_empty() {
                abandoned.push(*id);
            }
        }
        for id in abandoned {
            if let Some(pending) = self.take_unknown(id) {
                debug!(target = %pending.target, "Aborting abandoned dial");
                self.aborted.insert(id);
            }
        }
    }

    fn take_unknown(&mut self, connection_id: ConnectionId) -> Option<PendingDial> {
        let pending = self.pending_unknown.remove(&connection_id)?;
        self.pending_by_addr.retain(|_, id| *id != connection_id);
        Some(pending)
    }

    /// Which of two connections to the same peer both sides keep: the one
    /// dialed by the smaller peer id, else the older one.
    fn should_replace(&self, peer: PeerId, existing: &LiveConnection, new: &LiveConnection) -> bool {
        let preferred = self.local_peer_id.min(peer);
        new.dialer == preferred && existing.dialer != preferred
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                let full = with_peer_id(&address, self.local_peer_id);
                info!(address = %full, "Listening");
                {
                    let mut addrs = self.listen_addrs.write();
                    if !addrs.contains(&address) {
                        addrs.push(address);
                    }
                }
                let _ = self.events.send(NodeEvent::ListeningOn {
                    address: full.to_string(),
                });
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(%address, "Listen address expired");
                self.listen_addrs.write().retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                if self.aborted.remove(&connection_id) {
                    debug!(%peer_id, ?connection_id, "Closing connection from aborted dial");
                    self.swarm.close_connection(connection_id);
                    return;
                }

                let dialer = if endpoint.is_dialer() {
                    self.local_peer_id
                } else {
                    peer_id
                };
                let entry = LiveConnection {
                    connection_id,
                    remote_addr: endpoint.get_remote_address().clone(),
                    dialer,
                    connected_since: Utc::now(),
                };
                self.on_connection(peer_id, entry);

                if let Some(connection) = self.primary(peer_id) {
                    if let Some(pending) = self.pending_by_peer.remove(&peer_id) {
                        pending.succeed(&connection);
                    }
                    if let Some(pending) = self.take_unknown(connection_id) {
                        pending.succeed(&connection);
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                ..
            } => {
                let Some(conns) = self.live.get_mut(&peer_id) else {
                    return;
                };
                let was_primary = conns
                    .first()
                    .is_some_and(|c| c.connection_id == connection_id);
                conns.retain(|c| c.connection_id != connection_id);
                if was_primary {
                    self.closures.fire(&peer_id);
                }
                if conns.is_empty() {
                    self.live.remove(&peer_id);
                    self.health.remove(&peer_id);
                    info!(%peer_id, cause = ?cause, "Peer disconnected");
                    let _ = self.events.send(NodeEvent::PeerDisconnected {
                        peer_id: peer_id.to_string(),
                    });
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                self.aborted.remove(&connection_id);

                if let Some(pending) = self.take_unknown(connection_id) {
                    warn!(target = %pending.target, error = %error, "Dial failed");
                    let failure = DialFailure::from_swarm(pending.target.clone(), &error);
                    pending.fail(&failure);
                }

                let Some(peer) = peer_id else {
                    return;
                };
                let matches = self
                    .pending_by_peer
                    .get(&peer)
                    .is_some_and(|p| p.connection_id.map_or(true, |id| id == connection_id));
                if matches && !self.live.contains_key(&peer) {
                    if let Some(pending) = self.pending_by_peer.remove(&peer) {
                        warn!(%peer, error = %error, "Dial failed");
                        let failure = DialFailure::from_swarm(pending.target.clone(), &error);
                        pending.fail(&failure);
                    }
                }
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!(remote = %send_back_addr, error = %error, "Inbound connection failed");
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!(error = %error, "Listener error");
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(%peer_id, agent = %info.agent_version, "Identified peer");
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Ping(event)) => self.on_ping(event),
            _ => {}
        }
    }

    fn on_ping(&mut self, event: ping::Event) {
        let (peer, connection) = (event.peer, event.connection);
        let is_primary = self
            .live
            .get(&peer)
            .and_then(|conns| conns.first())
            .is_some_and(|c| c.connection_id == connection);
        if !is_primary {
            return;
        }

        let health = self.health.entry(peer).or_default();
        match event.result {
            Ok(rtt) => {
                health.latency = Some(rtt);
                health.failures = 0;
            }
            Err(e) => {
                health.failures += 1;
                warn!(%peer, failures = health.failures, error = %e, "Ping failed");
                if health.failures >= MAX_PING_FAILURES {
                    warn!(%peer, "Closing unresponsive connection");
                    self.close(connection);
                }
            }
        }
    }

    fn on_connection(&mut self, peer_id: PeerId, entry: LiveConnection) {
        let existing = self
            .live
            .get(&peer_id)
            .and_then(|conns| conns.first())
            .cloned();

        match existing {
            None => {
                info!(%peer_id, remote = %entry.remote_addr, "Peer connected");
                self.health.remove(&peer_id);
                self.live.insert(peer_id, vec![entry]);
                let _ = self.events.send(NodeEvent::PeerConnected {
                    peer_id: peer_id.to_string(),
                });
            }
            Some(existing) => {
                let replace = self.should_replace(peer_id, &existing, &entry);
                let closing = if replace {
                    existing.connection_id
                } else {
                    entry.connection_id
                };
                debug!(%peer_id, ?closing, "Closing redundant connection");
                let conns = self.live.entry(peer_id).or_default();
                if replace {
                    conns.insert(0, entry);
                } else {
                    conns.push(entry);
                }
                self.swarm.close_connection(closing);
            }
        }
    }
}
