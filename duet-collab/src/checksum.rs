//! Document digests compared by the consistency watchdog.
//!
//! A digest is `(hash, length)`: a 64-bit FNV-1a hash over the UTF-8 bytes
//! of the content and the content length in characters. A missing document
//! digests to `(-1, -1)`.
//!
//! Reference: Fowler, Noll, Vo: FNV hash, variant 1a

use std::fmt;

use crate::protocol::{DocPath, NON_EXISTING_DOC};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash and length of one document's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentDigest {
    pub hash: i64,
    pub length: i64,
}

impl DocumentDigest {
    pub const MISSING: DocumentDigest = DocumentDigest {
        hash: NON_EXISTING_DOC,
        length: NON_EXISTING_DOC,
    };

    pub fn of(content: &str) -> Self {
        Self {
            hash: content_hash(content),
            length: duet_core::char_len(content) as i64,
        }
    }

    /// `None` digests to [`DocumentDigest::MISSING`].
    pub fn of_optional(content: Option<&str>) -> Self {
        content.map_or(Self::MISSING, Self::of)
    }

    pub fn exists(&self) -> bool {
        *self != Self::MISSING
    }
}

impl fmt::Display for DocumentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}/{}", self.hash, self.length)
    }
}

fn content_hash(content: &str) -> i64 {
    let hash = content.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash as i64
}

/// Last digest observed for one tracked document.
#[derive(Debug, Clone)]
pub struct DocumentChecksum {
    path: DocPath,
    digest: Option<DocumentDigest>,
    updates: u64,
}

impl DocumentChecksum {
    pub fn new(path: DocPath) -> Self {
        Self {
            path,
            digest: None,
            updates: 0,
        }
    }

    pub fn path(&self) -> &DocPath {
        &self.path
    }

    /// `None` until the first update.
    pub fn digest(&self) -> Option<DocumentDigest> {
        self.digest
    }

    /// Number of updates that changed the digest.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Record a freshly computed digest. Returns whether it changed.
    pub fn update(&mut self, digest: DocumentDigest) -> bool {
        if self.digest == Some(digest) {
            return false;
        }
        self.digest = Some(digest);
        self.updates += 1;
        true
    }
}
