//! Client side of the consistency watchdog.
//!
//! Each incoming checksum is compared against the local copy. Checksums
//! taken while operations were in flight are deferred; the next cycle
//! produces a fresh one. A mismatch resets the document's Jupiter channel
//! and marks the path inconsistent until a later checksum matches again
//! (normally after the session resynchronized the content).

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;

use crate::checksum::DocumentDigest;
use crate::protocol::{ChecksumActivity, DocPath};
use crate::registry::JupiterRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumVerdict {
    Consistent,
    Inconsistent,
    /// The checksum describes a different channel state; not compared.
    Deferred,
}

pub struct ConsistencyChecker {
    registry: Arc<JupiterRegistry>,
    inconsistent: watch::Sender<BTreeSet<DocPath>>,
}

impl ConsistencyChecker {
    pub fn new(registry: Arc<JupiterRegistry>) -> Self {
        let (inconsistent, _) = watch::channel(BTreeSet::new());
        Self {
            registry,
            inconsistent,
        }
    }

    pub fn registry(&self) -> &Arc<JupiterRegistry> {
        &self.registry
    }

    /// Compare `checksum` with the local content of its document.
    ///
    /// `local` must be read in the same critical section that applies
    /// incoming operations, so that it matches the registry's clock.
    pub fn check(&self, checksum: &ChecksumActivity, local: Option<&str>) -> ChecksumVerdict {
        if !self.registry.is_current(checksum) {
            log::trace!("Deferring {checksum}: channel at {:?}", self.registry.timestamp(&checksum.path));
            return ChecksumVerdict::Deferred;
        }

        let path = &checksum.path;
        let local_digest = DocumentDigest::of_optional(local);
        if local_digest == checksum.digest() {
            let recovered = self.inconsistent.send_if_modified(|paths| paths.remove(path));
            if recovered {
                log::info!("{path} is consistent again");
            }
            return ChecksumVerdict::Consistent;
        }

        log::warn!(
            "Inconsistency detected in {path}: local {local_digest}, remote {}",
            checksum.digest()
        );
        self.registry.reset_one(path);
        self.inconsistent
            .send_if_modified(|paths| paths.insert(path.clone()));
        ChecksumVerdict::Inconsistent
    }

    pub fn is_inconsistent(&self, path: &DocPath) -> bool {
        self.inconsistent.borrow().contains(path)
    }

    pub fn inconsistent_paths(&self) -> BTreeSet<DocPath> {
        self.inconsistent.borrow().clone()
    }

    /// Notified whenever the set of inconsistent paths changes.
    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<DocPath>> {
        self.inconsistent.subscribe()
    }

    /// Forget every inconsistency, e.g. after a full resynchronization.
    pub fn clear(&self) {
        self.inconsistent.send_if_modified(|paths| {
            let changed = !paths.is_empty();
            paths.clear();
            changed
        });
    }
}
