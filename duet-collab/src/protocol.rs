//! Activities exchanged between sites.
//!
//! Wire format (bincode-encoded [`Activity`]):
//! ```text
//! ┌─────────┬───────────┬──────────┬──────────────────────────────────┐
//! │ variant │ source    │ path     │ body                             │
//! │ 1 byte  │ 16 bytes  │ varint+n │ timestamp+operation | hash+length│
//! └─────────┴───────────┴──────────┴──────────────────────────────────┘
//! ```
//!
//! Framing and delivery belong to the transport; this module only defines
//! the values and their encoding.

use duet_core::{Operation, StampedOperation, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::checksum::DocumentDigest;

/// Project-relative path of a shared document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocPath(String);

impl DocPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for DocPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// A stamped operation on one document, as sent over a Jupiter channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JupiterActivity {
    /// Site that authored the edit. Relayed activities keep the author.
    pub source: Uuid,
    pub path: DocPath,
    pub timestamp: Timestamp,
    pub operation: Operation,
}

impl JupiterActivity {
    pub fn new(source: Uuid, path: DocPath, stamped: StampedOperation) -> Self {
        Self {
            source,
            path,
            timestamp: stamped.timestamp,
            operation: stamped.operation,
        }
    }

    pub fn into_stamped(self) -> StampedOperation {
        StampedOperation {
            timestamp: self.timestamp,
            operation: self.operation,
        }
    }
}

/// Value of `hash` and `length` for a document missing at the source.
pub const NON_EXISTING_DOC: i64 = -1;

/// Digest of one document as seen by `source`.
///
/// The timestamp is only present when the recipient has a Jupiter channel
/// for the path; it tells the recipient which state the digest describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumActivity {
    pub source: Uuid,
    pub path: DocPath,
    pub hash: i64,
    pub length: i64,
    pub timestamp: Option<Timestamp>,
}

impl ChecksumActivity {
    pub fn new(source: Uuid, path: DocPath, digest: DocumentDigest) -> Self {
        Self {
            source,
            path,
            hash: digest.hash,
            length: digest.length,
            timestamp: None,
        }
    }

    /// The document does not exist at `source`.
    pub fn missing(source: Uuid, path: DocPath) -> Self {
        Self {
            source,
            path,
            hash: NON_EXISTING_DOC,
            length: NON_EXISTING_DOC,
            timestamp: None,
        }
    }

    pub fn with_timestamp(self, timestamp: Timestamp) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..self
        }
    }

    pub fn exists(&self) -> bool {
        !(self.hash == NON_EXISTING_DOC && self.length == NON_EXISTING_DOC)
    }

    pub fn digest(&self) -> DocumentDigest {
        DocumentDigest {
            hash: self.hash,
            length: self.length,
        }
    }
}

impl fmt::Display for ChecksumActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum(path:{}, hash:{}, length:{}", self.path, self.hash, self.length)?;
        if let Some(ts) = self.timestamp {
            write!(f, ", at:{ts}")?;
        }
        write!(f, ")")
    }
}

/// Top-level envelope handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    Jupiter(JupiterActivity),
    Checksum(ChecksumActivity),
}

impl Activity {
    pub fn source(&self) -> Uuid {
        match self {
            Activity::Jupiter(a) => a.source,
            Activity::Checksum(a) => a.source,
        }
    }

    pub fn path(&self) -> &DocPath {
        match self {
            Activity::Jupiter(a) => &a.path,
            Activity::Checksum(a) => &a.path,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (activity, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(activity)
    }
}

impl From<JupiterActivity> for Activity {
    fn from(activity: JupiterActivity) -> Self {
        Activity::Jupiter(activity)
    }
}

impl From<ChecksumActivity> for Activity {
    fn from(activity: ChecksumActivity) -> Self {
        Activity::Checksum(activity)
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
