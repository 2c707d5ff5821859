//! Envelope cipher.
//!
//! AES-256-GCM over arbitrary payloads. The wire layout is
//! `nonce[12] || ciphertext[N] || tag[16]`, base64-encoded for transport,
//! which is byte-compatible with the authority's web tooling.
//!
//! [`seal`] always draws a fresh random nonce; there is no way to pass one in.
//! [`open`] fails closed: anything short, truncated or tampered yields
//! [`Error::Authentication`] and no plaintext.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fmt;

/// Key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Smallest possible envelope (empty plaintext).
pub const MIN_ENVELOPE_LEN: usize = NONCE_LEN + TAG_LEN;

/// A 256-bit envelope key.
#[derive(Clone, PartialEq, Eq)]
pub struct EnvelopeKey([u8; KEY_LEN]);

impl EnvelopeKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, which must be exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice has the wrong length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::Serialization(format!(
                "envelope key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Generate a random key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Decode a base64 key.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not base64 or not 32 bytes long.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Serialization(format!("invalid base64 key: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// Encode the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnvelopeKey(..)")
    }
}

/// `nonce || ciphertext || tag`, as produced by [`seal`].
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope(Vec<u8>);

impl EncryptedEnvelope {
    /// Raw envelope bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The nonce this envelope was sealed with.
    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.0[..NONCE_LEN]
    }

    /// Base64 transport encoding.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Envelope length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false: an envelope carries at least a nonce and a tag.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for EncryptedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedEnvelope({} bytes)", self.0.len())
    }
}

/// Encrypt `plaintext` under `key` with a freshly drawn nonce.
///
/// # Errors
///
/// Returns an error only if the plaintext exceeds the AES-GCM length limit.
pub fn seal(plaintext: &[u8], key: &EnvelopeKey) -> Result<EncryptedEnvelope> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the tag to the ciphertext
    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::Serialization("plaintext too large to seal".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(EncryptedEnvelope(out))
}

/// Decrypt a raw envelope.
///
/// # Errors
///
/// Returns [`Error::Authentication`] if the envelope is shorter than
/// nonce + tag or the tag does not verify.
pub fn open(envelope: &[u8], key: &EnvelopeKey) -> Result<Vec<u8>> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(Error::Authentication);
    }

    let (nonce, sealed) = envelope.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::Authentication)
}

/// Decrypt a base64-encoded envelope. Undecodable input is treated as a
/// corrupt envelope.
///
/// # Errors
///
/// Returns [`Error::Authentication`] on any decoding or integrity failure.
pub fn open_base64(encoded: &str, key: &EnvelopeKey) -> Result<Vec<u8>> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| Error::Authentication)?;
    open(&bytes, key)
}
