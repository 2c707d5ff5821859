//! Node identity.
//!
//! One Ed25519 keypair per running node. The peer id is derived from the
//! public key and never changes for the lifetime of the process.

use crate::error::{Error, Result};
use libp2p::identity::Keypair;
use libp2p::PeerId;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tracing::info;

/// File name used for the persisted keypair inside the node's root directory.
pub const KEY_FILE_NAME: &str = "node_key";

/// A node's cryptographic identity.
#[derive(Clone)]
pub struct PeerIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl PeerIdentity {
    /// Generate a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    /// Wrap an existing keypair.
    #[must_use]
    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    /// Derive a reproducible identity from a seed string: the SHA-256 of the
    /// seed is used as the Ed25519 secret key.
    ///
    /// # Errors
    ///
    /// Returns an error if the derived bytes are rejected as a secret key.
    pub fn from_seed(seed: &str) -> Result<Self> {
        let mut secret: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
        let keypair = Keypair::ed25519_from_bytes(&mut secret)
            .map_err(|e| Error::Identity(format!("invalid seed-derived key: {e}")))?;
        Ok(Self::from_keypair(keypair))
    }

    /// Decode a protobuf-encoded keypair.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoded keypair.
    pub fn from_protobuf(bytes: &[u8]) -> Result<Self> {
        let keypair = Keypair::from_protobuf_encoding(bytes)
            .map_err(|e| Error::Identity(format!("decoding node key: {e}")))?;
        Ok(Self::from_keypair(keypair))
    }

    /// Encode the keypair as protobuf bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the key type cannot be encoded.
    pub fn to_protobuf(&self) -> Result<Vec<u8>> {
        self.keypair
            .to_protobuf_encoding()
            .map_err(|e| Error::Identity(format!("encoding node key: {e}")))
    }

    /// Load the keypair at `path`, or generate and persist a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or decoded, or a
    /// new one cannot be written.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let bytes = std::fs::read(path)?;
            let identity = Self::from_protobuf(&bytes)?;
            info!(peer_id = %identity.peer_id, "Loaded existing node identity");
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!(peer_id = %identity.peer_id, path = %path.display(), "Generated new node identity");
        Ok(identity)
    }

    /// Persist the keypair to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_protobuf()?)?;
        Ok(())
    }

    /// The stable peer identifier.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The underlying keypair.
    #[must_use]
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
