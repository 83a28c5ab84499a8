//! Host-side relay: one server-role Jupiter proxy per (document, client).
//!
//! ```text
//!              ┌──────────── JupiterHost ────────────┐
//! Client A ──► │ doc ─┬─ proxy(A) ──► host buffer    │
//!              │      ├─ proxy(B) ──► generate ──────┼──► Client B
//!              │      └─ proxy(C) ──► generate ──────┼──► Client C
//!              └─────────────────────────────────────┘
//! ```
//!
//! An activity from client A is transformed by A's proxy into the host's
//! document state, applied by the caller, then re-generated through every
//! other client's proxy. Relayed activities keep A as their source.
//!
//! Lock order: the clients set and the documents map are never held at the
//! same time; a document's proxy table is only locked under the map read
//! lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use duet_core::{Jupiter, Operation, OperationError, Timestamp, TransformationError};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{DocPath, JupiterActivity};

/// Errors raised while relaying an activity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("activity from unknown client {0}")]
    UnknownClient(Uuid),
    #[error("transformation failed for {peer} on {path}: {source}")]
    Transformation {
        peer: Uuid,
        path: DocPath,
        #[source]
        source: TransformationError,
    },
    /// The transformed operation did not fit the host's copy. The sender's
    /// proxy was reset and nothing was relayed.
    #[error("operation from {peer} does not apply on {path}: {source}")]
    Apply {
        peer: Uuid,
        path: DocPath,
        #[source]
        source: OperationError,
    },
}

/// An activity addressed to one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub recipient: Uuid,
    pub activity: JupiterActivity,
}

/// Result of relaying one client activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relayed {
    /// Operation to apply to the host's copy of the document.
    pub operation: Operation,
    /// Activities for every other client, in client order.
    pub outbound: Vec<Outbound>,
}

#[derive(Default)]
struct DocumentProxies {
    proxies: FxHashMap<Uuid, Jupiter>,
}

impl DocumentProxies {
    fn proxy(&mut self, peer: Uuid) -> &mut Jupiter {
        self.proxies.entry(peer).or_insert_with(Jupiter::server)
    }
}

pub struct JupiterHost {
    local_site: Uuid,
    clients: RwLock<BTreeSet<Uuid>>,
    documents: RwLock<FxHashMap<DocPath, Arc<Mutex<DocumentProxies>>>>,
}

impl JupiterHost {
    pub fn new(local_site: Uuid) -> Self {
        Self {
            local_site,
            clients: RwLock::new(BTreeSet::new()),
            documents: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn local_site(&self) -> Uuid {
        self.local_site
    }

    /// Register a client. Its proxies start at the reset state.
    pub fn add_client(&self, peer: Uuid) -> bool {
        let added = self.clients.write().insert(peer);
        if added {
            log::info!("Client {peer} joined");
        }
        added
    }

    /// Unregister a client and drop its proxies.
    pub fn remove_client(&self, peer: &Uuid) -> bool {
        let removed = self.clients.write().remove(peer);
        if removed {
            for doc in self.documents.read().values() {
                doc.lock().proxies.remove(peer);
            }
            log::info!("Client {peer} left");
        }
        removed
    }

    pub fn has_client(&self, peer: &Uuid) -> bool {
        self.clients.read().contains(peer)
    }

    pub fn clients(&self) -> Vec<Uuid> {
        self.clients.read().iter().copied().collect()
    }

    pub fn paths(&self) -> Vec<DocPath> {
        let mut paths: Vec<DocPath> = self.documents.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn with_document<R>(&self, path: &DocPath, f: impl FnOnce(&mut DocumentProxies) -> R) -> R {
        {
            let documents = self.documents.read();
            if let Some(doc) = documents.get(path) {
                return f(&mut doc.lock());
            }
        }

        let mut documents = self.documents.write();
        let doc = documents.entry(path.clone()).or_insert_with(|| {
            log::debug!("Creating Jupiter proxies for {path}");
            Arc::new(Mutex::new(DocumentProxies::default()))
        });
        let result = f(&mut doc.lock());
        result
    }

    /// Stamp an edit made on the host's own buffer for every client.
    pub fn generate(&self, path: &DocPath, operation: Operation) -> Vec<Outbound> {
        let clients = self.clients();
        self.with_document(path, |doc| {
            clients
                .into_iter()
                .map(|recipient| {
                    let stamped = doc.proxy(recipient).generate(operation.clone());
                    Outbound {
                        recipient,
                        activity: JupiterActivity::new(self.local_site, path.clone(), stamped),
                    }
                })
                .collect()
        })
    }

    /// Transform a client activity into the host state and fan it out.
    ///
    /// On error no proxy is modified.
    pub fn receive(&self, activity: JupiterActivity) -> Result<Relayed, HostError> {
        self.receive_with(activity, |_| Ok(()))
    }

    /// Like [`receive`](Self::receive), applying the transformed operation
    /// to the host's copy through `apply` before anything is relayed.
    ///
    /// If `apply` fails the sender's channel has diverged: its proxy is
    /// dropped, the other proxies are left untouched and no outbound
    /// activity is produced. The caller must resynchronize the sender.
    pub fn receive_with(
        &self,
        activity: JupiterActivity,
        apply: impl FnOnce(&Operation) -> Result<(), OperationError>,
    ) -> Result<Relayed, HostError> {
        let sender = activity.source;
        let clients = self.clients();
        if !clients.contains(&sender) {
            return Err(HostError::UnknownClient(sender));
        }

        let path = activity.path.clone();
        self.with_document(&path, |doc| {
            let operation = doc
                .proxy(sender)
                .receive(activity.into_stamped())
                .map_err(|source| {
                    log::warn!("Rejected activity from {sender} on {path}: {source}");
                    HostError::Transformation {
                        peer: sender,
                        path: path.clone(),
                        source,
                    }
                })?;

            if let Err(source) = apply(&operation) {
                log::warn!("Dropping diverged channel of {sender} on {path}: {source}");
                doc.proxies.remove(&sender);
                return Err(HostError::Apply {
                    peer: sender,
                    path: path.clone(),
                    source,
                });
            }

            let outbound = clients
                .iter()
                .filter(|peer| **peer != sender)
                .map(|&recipient| {
                    let stamped = doc.proxy(recipient).generate(operation.clone());
                    Outbound {
                        recipient,
                        activity: JupiterActivity::new(sender, path.clone(), stamped),
                    }
                })
                .collect();

            log::trace!("Relayed {operation} on {path} from {sender}");
            Ok(Relayed { operation, outbound })
        })
    }

    /// Clock of `peer`'s proxy for `path`, if it exists.
    pub fn timestamp(&self, peer: &Uuid, path: &DocPath) -> Option<Timestamp> {
        let documents = self.documents.read();
        let doc = documents.get(path)?;
        let doc = doc.lock();
        doc.proxies.get(peer).map(Jupiter::timestamp)
    }

    /// Clock of every client's channel for `path`, in client order.
    ///
    /// Clients without a proxy yet are at the reset state. Read together
    /// with the host's copy of the document to stamp checksums.
    pub fn clocks(&self, path: &DocPath) -> Vec<(Uuid, Timestamp)> {
        let clients = self.clients();
        let documents = self.documents.read();
        let doc = documents.get(path).map(|doc| doc.lock());
        clients
            .into_iter()
            .map(|peer| {
                let timestamp = doc
                    .as_ref()
                    .and_then(|doc| doc.proxies.get(&peer))
                    .map_or(Timestamp::ZERO, Jupiter::timestamp);
                (peer, timestamp)
            })
            .collect()
    }

    /// Drop every proxy for `path`.
    pub fn reset_one(&self, path: &DocPath) -> bool {
        let removed = self.documents.write().remove(path).is_some();
        if removed {
            log::info!("Reset Jupiter proxies for {path}");
        }
        removed
    }

    /// Reset the channel between the host and one client for one document.
    pub fn reset_client_document(&self, peer: &Uuid, path: &DocPath) -> bool {
        let documents = self.documents.read();
        let Some(doc) = documents.get(path) else {
            return false;
        };
        let removed = doc.lock().proxies.remove(peer).is_some();
        if removed {
            log::info!("Reset Jupiter proxy of {peer} for {path}");
        }
        removed
    }

    pub fn reset_all(&self) -> usize {
        let mut documents = self.documents.write();
        let count = documents.len();
        documents.clear();
        log::info!("Reset Jupiter proxies for {count} documents");
        count
    }
}
