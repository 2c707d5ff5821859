//! Composite libp2p behaviour for dsn nodes.

use crate::error::Error;
use crate::identity::PeerIdentity;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, noise, ping, tcp, yamux, Swarm, SwarmBuilder};
use std::time::Duration;

/// Protocol string advertised through identify.
pub const IDENTIFY_PROTOCOL: &str = "/dsn/id/1.0.0";

/// Raw application streams plus identify and liveness pings.
#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub(crate) stream: libp2p_stream::Behaviour,
    pub(crate) identify: identify::Behaviour,
    pub(crate) ping: ping::Behaviour,
}

/// Transport-level knobs for [`build_swarm`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct SwarmSettings {
    pub(crate) idle_timeout: Duration,
    pub(crate) ping_interval: Duration,
}

/// Build a TCP + Noise + Yamux swarm around `identity`.
pub(crate) fn build_swarm(
    identity: &PeerIdentity,
    settings: SwarmSettings,
) -> crate::error::Result<Swarm<NodeBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(identity.keypair().clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| Error::Transport(format!("tcp transport: {e}")))?
        .with_behaviour(|key| NodeBehaviour {
            stream: libp2p_stream::Behaviour::new(),
            identify: identify::Behaviour::new(
                identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                    .with_agent_version(format!("dsn-node/{}", env!("CARGO_PKG_VERSION"))),
            ),
            ping: ping::Behaviour::new(ping::Config::new().with_interval(settings.ping_interval)),
        })
        .map_err(|e| Error::Transport(format!("swarm behaviour: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(settings.idle_timeout))
        .build();

    Ok(swarm)
}
