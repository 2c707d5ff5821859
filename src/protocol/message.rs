//! Protocol identifiers and their payload schemas.
//!
//! Each identifier names exactly one request schema (and at most one response
//! schema). Payloads are JSON; unknown fields are rejected at the boundary.

use crate::criteria::Criteria;
use crate::error::{Error, ProtocolErrorKind, Result};
use libp2p::StreamProtocol;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `/print/1.0.0`: log a message on the remote node.
pub const PRINT: &str = "/print/1.0.0";
/// `/echo/1.0.0`: raw bytes echoed back.
pub const ECHO: &str = "/echo/1.0.0";
/// `/new-user/1.0.0`: hand custody of an encrypted user record to a peer.
pub const NEW_USER: &str = "/new-user/1.0.0";
/// `/upload/1.0.0`: ask a peer to seal, store and replicate a payload.
pub const UPLOAD: &str = "/upload/1.0.0";
/// `/store/1.0.0`: replicate a sealed data block.
pub const STORE: &str = "/store/1.0.0";
/// `/verify/1.0.0`: evaluate criteria against a custodied record.
pub const VERIFY: &str = "/verify/1.0.0";

/// A validated, versioned protocol identifier: `/<name>[/<name>...]/<major>.<minor>.<patch>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolId(StreamProtocol);

impl ProtocolId {
    /// Validate and wrap an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolErrorKind::InvalidIdentifier`] if the string lacks a
    /// leading `/`, a name segment, or a trailing three-part version.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if !is_versioned(&id) {
            return Err(Error::protocol(&id, ProtocolErrorKind::InvalidIdentifier));
        }
        StreamProtocol::try_from_owned(id.clone())
            .map(Self)
            .map_err(|_| Error::protocol(id, ProtocolErrorKind::InvalidIdentifier))
    }

    /// Wrap one of the built-in identifier constants.
    pub(crate) fn builtin(id: &'static str) -> Self {
        Self(StreamProtocol::new(id))
    }

    /// The identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }

    pub(crate) fn stream_protocol(&self) -> StreamProtocol {
        self.0.clone()
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_versioned(id: &str) -> bool {
    let Some(rest) = id.strip_prefix('/') else {
        return false;
    };
    let Some((name, version)) = rest.rsplit_once('/') else {
        return false;
    };
    let name_ok = !name.is_empty() && name.split('/').all(|s| !s.is_empty());
    let parts: Vec<&str> = version.split('.').collect();
    let version_ok = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    name_ok && version_ok
}

/// Serialize a payload for the wire.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if encoding fails.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Parse a payload received on `protocol`, rejecting anything that does not
/// match the schema exactly.
///
/// # Errors
///
/// Returns [`ProtocolErrorKind::Malformed`].
pub fn decode<T: DeserializeOwned>(protocol: &ProtocolId, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::protocol(protocol, ProtocolErrorKind::Malformed(e.to_string())))
}

/// `/print/1.0.0` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrintMessage {
    /// Text to log.
    pub message: String,
}

/// `/new-user/1.0.0` request: a sealed user record and the key to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewUser {
    /// User identifier.
    pub id: String,
    /// Base64 envelope of the user's JSON record.
    pub u: String,
    /// Base64 envelope key.
    pub k: String,
}

/// Acknowledgement carrying the identifier that was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Receipt {
    /// User id or block hash.
    pub id: String,
}

/// `/upload/1.0.0` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadRequest {
    /// Base64 plaintext.
    pub data: String,
}

/// `/upload/1.0.0` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadReceipt {
    /// SHA-256 hex of the envelope bytes.
    pub hash: String,
    /// Base64 key the envelope was sealed under.
    pub key: String,
}

/// `/store/1.0.0` request: a content-addressed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataBlock {
    /// SHA-256 hex of the decoded envelope.
    pub hash: String,
    /// Base64 envelope.
    pub cipher: String,
}

/// `/verify/1.0.0` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyRequest {
    /// Verification request the round belongs to.
    pub request_id: String,
    /// Subject whose custodied record is evaluated.
    pub subject_id: String,
    /// Criteria to evaluate.
    pub criteria: Criteria,
}

/// `/verify/1.0.0` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyResponse {
    /// Echo of the request id.
    pub request_id: String,
    /// Outcome.
    pub verdict: Verdict,
}

/// Outcome of evaluating criteria on a custody peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// The record satisfies the criteria.
    Eligible,
    /// The record does not satisfy the criteria.
    Ineligible,
    /// The peer holds no record for the subject.
    UnknownSubject,
    /// The record could not be opened or evaluated.
    Unverifiable,
}

impl Verdict {
    /// Whether the verdict is an actual yes/no answer.
    #[must_use]
    pub fn is_conclusive(self) -> bool {
        matches!(self, Self::Eligible | Self::Ineligible)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eligible => "eligible",
            Self::Ineligible => "ineligible",
            Self::UnknownSubject => "unknown subject",
            Self::Unverifiable => "unverifiable",
        };
        f.write_str(s)
    }
}
