//! Custody of sealed records on a storage peer.
//!
//! A storage peer keeps the envelopes it was handed, keyed by user id or by
//! content hash, and opens them only to answer verification queries.

use crate::cipher::{self, EnvelopeKey};
use crate::criteria::{parse_record, Criteria, Record};
use crate::error::{Error, Result};
use crate::protocol::message::{DataBlock, NewUser, Verdict};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// SHA-256 hex digest used to content-address envelopes.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A user's sealed record and the key that opens it.
#[derive(Debug, Clone)]
pub struct CustodyRecord {
    /// User identifier.
    pub user_id: String,
    /// Raw envelope bytes.
    pub envelope: Vec<u8>,
    /// Envelope key.
    pub key: EnvelopeKey,
    /// When custody was accepted.
    pub received_at: DateTime<Utc>,
}

impl CustodyRecord {
    /// Open the envelope and parse the record inside it.
    ///
    /// # Errors
    ///
    /// [`Error::Authentication`] if the envelope does not open, otherwise an
    /// error if the plaintext is not a JSON object.
    pub fn open(&self) -> Result<Record> {
        let plaintext = cipher::open(&self.envelope, &self.key)?;
        parse_record(&plaintext)
    }

    /// Answer `criteria` for this record.
    ///
    /// Rules that cannot be applied to the record count as non-matching, so
    /// the answer does not depend on rule order. Only a record that cannot be
    /// opened is [`Verdict::Unverifiable`].
    #[must_use]
    pub fn verdict(&self, criteria: &Criteria) -> Verdict {
        match self.open() {
            Ok(record) if criteria.evaluate(&record) => Verdict::Eligible,
            Ok(_) => Verdict::Ineligible,
            Err(_) => Verdict::Unverifiable,
        }
    }
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, CustodyRecord>,
    blocks: HashMap<String, Vec<u8>>,
}

/// In-memory custody store shared by a node's handlers.
#[derive(Clone, Default)]
pub struct CustodyStore {
    inner: Arc<RwLock<Inner>>,
}

impl CustodyStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept custody of a user record, replacing any earlier one.
    ///
    /// # Errors
    ///
    /// [`Error::Serialization`] if the envelope or key is not valid base64 or
    /// the key has the wrong length.
    pub fn put_user(&self, message: &NewUser) -> Result<()> {
        if message.id.is_empty() {
            return Err(Error::Serialization("empty user id".to_string()));
        }
        let envelope = STANDARD
            .decode(message.u.trim())
            .map_err(|e| Error::Serialization(format!("user envelope: {e}")))?;
        let key = EnvelopeKey::from_base64(&message.k)?;

        let record = CustodyRecord {
            user_id: message.id.clone(),
            envelope,
            key,
            received_at: Utc::now(),
        };
        self.inner.write().users.insert(message.id.clone(), record);
        Ok(())
    }

    /// The record held for `user_id`.
    #[must_use]
    pub fn user(&self, user_id: &str) -> Option<CustodyRecord> {
        self.inner.read().users.get(user_id).cloned()
    }

    /// Store a data block after checking that its hash matches its content.
    ///
    /// # Errors
    ///
    /// [`Error::Serialization`] for undecodable content, [`Error::Authentication`]
    /// if the hash does not match.
    pub fn put_block(&self, block: &DataBlock) -> Result<()> {
        let bytes = STANDARD
            .decode(block.cipher.trim())
            .map_err(|e| Error::Serialization(format!("data block: {e}")))?;
        if content_hash(&bytes) != block.hash.to_ascii_lowercase() {
            return Err(Error::Authentication);
        }
        self.inner
            .write()
            .blocks
            .insert(block.hash.to_ascii_lowercase(), bytes);
        Ok(())
    }

    /// The envelope stored under `hash`.
    #[must_use]
    pub fn block(&self, hash: &str) -> Option<Vec<u8>> {
        self.inner
            .read()
            .blocks
            .get(&hash.to_ascii_lowercase())
            .cloned()
    }

    /// Number of user records held.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.inner.read().users.len()
    }

    /// Number of data blocks held.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }
}

impl std::fmt::Debug for CustodyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("CustodyStore")
            .field("users", &inner.users.len())
            .field("blocks", &inner.blocks.len())
            .finish()
    }
}
