//! Multiaddress helpers.

use crate::error::{Error, Result};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

/// Parse a multiaddress string such as `/ip4/0.0.0.0/tcp/4001`.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] if the string is empty or malformed.
pub fn parse_multiaddr(input: &str) -> Result<Multiaddr> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidAddress("empty address".to_string()));
    }
    trimmed
        .parse()
        .map_err(|e| Error::InvalidAddress(format!("{trimmed}: {e}")))
}

/// Split off a trailing `/p2p/<peer id>` component, if any.
#[must_use]
pub fn split_peer_id(addr: &Multiaddr) -> (Option<PeerId>, Multiaddr) {
    let peer = addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    });
    let bare = addr
        .iter()
        .filter(|p| !matches!(p, Protocol::P2p(_)))
        .collect();
    (peer, bare)
}

/// Append `/p2p/<peer>` unless the address already names a peer.
#[must_use]
pub fn with_peer_id(addr: &Multiaddr, peer: PeerId) -> Multiaddr {
    match split_peer_id(addr) {
        (Some(_), _) => addr.clone(),
        (None, bare) => bare.with(Protocol::P2p(peer)),
    }
}

/// Parse an address that must carry a peer id, e.g. a bootstrap entry.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] if parsing fails or no peer id is present.
pub fn parse_peer_addr(input: &str) -> Result<(PeerId, Multiaddr)> {
    let addr = parse_multiaddr(input)?;
    match split_peer_id(&addr) {
        (Some(peer), bare) => Ok((peer, bare)),
        (None, _) => Err(Error::InvalidAddress(format!(
            "{input}: missing /p2p/<peer id> suffix"
        ))),
    }
}
