//! Client-side map from document path to Jupiter channel.
//!
//! ```text
//! local edit ──► generate(path, op) ──► JupiterActivity ──► host
//! host ──► JupiterActivity ──► apply_incoming ──► Operation ──► buffer
//! ```
//!
//! Engines are created lazily on first use. The map is guarded by a
//! `parking_lot::RwLock`; each engine by its own mutex, so edits to
//! different documents proceed in parallel. Every engine access holds the
//! map read lock, which makes `reset_one`/`reset_all` wait for in-flight
//! transformations instead of racing them.

use std::sync::Arc;

use duet_core::{Jupiter, Operation, TextEdit, Timestamp, TransformationError};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::protocol::{ChecksumActivity, DocPath, JupiterActivity};

pub struct JupiterRegistry {
    local_site: Uuid,
    engines: RwLock<FxHashMap<DocPath, Arc<Mutex<Jupiter>>>>,
}

impl JupiterRegistry {
    pub fn new(local_site: Uuid) -> Self {
        Self {
            local_site,
            engines: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn local_site(&self) -> Uuid {
        self.local_site
    }

    /// Run `f` against the engine for `path`, creating it if needed.
    fn with_engine<R>(&self, path: &DocPath, f: impl FnOnce(&mut Jupiter) -> R) -> R {
        // Fast path: read lock
        {
            let engines = self.engines.read();
            if let Some(engine) = engines.get(path) {
                return f(&mut engine.lock());
            }
        }

        let mut engines = self.engines.write();
        let engine = engines.entry(path.clone()).or_insert_with(|| {
            log::debug!("Creating Jupiter client for {path}");
            Arc::new(Mutex::new(Jupiter::client()))
        });
        let result = f(&mut engine.lock());
        result
    }

    /// Copy of the engine for `path`, created on first use.
    ///
    /// The copy is detached: generating or receiving on it does not touch
    /// the registry's channel, and it goes stale on the next operation or
    /// reset. Use it to inspect clocks and the outstanding buffer.
    pub fn get(&self, path: &DocPath) -> Jupiter {
        self.with_engine(path, |engine| engine.clone())
    }

    pub fn contains(&self, path: &DocPath) -> bool {
        self.engines.read().contains_key(path)
    }

    pub fn paths(&self) -> Vec<DocPath> {
        let mut paths: Vec<DocPath> = self.engines.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.engines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.read().is_empty()
    }

    /// Discard the engine for `path`. The next access starts a fresh channel.
    ///
    /// Must be paired with re-synchronizing the document content.
    pub fn reset_one(&self, path: &DocPath) -> bool {
        let removed = self.engines.write().remove(path).is_some();
        if removed {
            log::info!("Reset Jupiter channel for {path}");
        }
        removed
    }

    /// Discard every engine. Returns how many were dropped.
    pub fn reset_all(&self) -> usize {
        let mut engines = self.engines.write();
        let count = engines.len();
        engines.clear();
        log::info!("Reset {count} Jupiter channels");
        count
    }

    /// Stamp a local edit for sending to the host.
    pub fn generate(&self, path: &DocPath, operation: Operation) -> JupiterActivity {
        let stamped = self.with_engine(path, |engine| engine.generate(operation));
        log::trace!("Generated {} on {path} at {}", stamped.operation, stamped.timestamp);
        JupiterActivity::new(self.local_site, path.clone(), stamped)
    }

    pub fn generate_from_edit(&self, path: &DocPath, edit: &TextEdit) -> JupiterActivity {
        self.generate(path, edit.to_operation())
    }

    /// Transform an activity from the host into an operation applicable to
    /// the local buffer.
    pub fn apply_incoming(&self, activity: JupiterActivity) -> Result<Operation, TransformationError> {
        let path = activity.path.clone();
        let result = self.with_engine(&path, |engine| engine.receive(activity.into_stamped()));
        if let Err(e) = &result {
            log::warn!("Rejected activity on {path}: {e}");
        }
        result
    }

    /// Current clock of the channel for `path`, if one exists.
    pub fn timestamp(&self, path: &DocPath) -> Option<Timestamp> {
        self.engines.read().get(path).map(|engine| engine.lock().timestamp())
    }

    /// Whether the checksum's timestamp describes the local channel state.
    ///
    /// A checksum without a timestamp is always current. A path without an
    /// engine is at the reset state.
    pub fn is_current(&self, checksum: &ChecksumActivity) -> bool {
        let Some(remote_time) = checksum.timestamp else {
            return true;
        };
        match self.engines.read().get(&checksum.path) {
            Some(engine) => engine.lock().is_current(remote_time),
            None => remote_time == Timestamp::ZERO,
        }
    }
}
