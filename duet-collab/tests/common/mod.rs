//! In-memory star session shared by the integration tests.
//!
//! The host's documents and its Jupiter relay are updated under one lock,
//! which is also held while the watchdog reads a document, so checksums
//! always match the clocks they are stamped with.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use duet_collab::{
    ChecksumDispatch, ChecksumVerdict, ConnectionState, ConsistencyChecker, DocPath,
    DocumentSnapshot, HostError, JupiterActivity, JupiterHost, JupiterRegistry, SessionError,
    WatchdogSession,
};
use duet_core::Operation;
use parking_lot::Mutex;
use uuid::Uuid;

pub struct HostSession {
    pub site: Uuid,
    pub relay: JupiterHost,
    pub documents: Mutex<BTreeMap<DocPath, String>>,
    pub locally_open: Mutex<BTreeSet<DocPath>>,
    pub remotely_open: Mutex<BTreeSet<DocPath>>,
    pub connection: Mutex<ConnectionState>,
    pub active: AtomicBool,
}

impl HostSession {
    pub fn new() -> Self {
        let site = Uuid::new_v4();
        Self {
            site,
            relay: JupiterHost::new(site),
            documents: Mutex::new(BTreeMap::new()),
            locally_open: Mutex::new(BTreeSet::new()),
            remotely_open: Mutex::new(BTreeSet::new()),
            connection: Mutex::new(ConnectionState::Connected),
            active: AtomicBool::new(true),
        }
    }

    pub fn content(&self, path: &DocPath) -> Option<String> {
        self.documents.lock().get(path).cloned()
    }

    pub fn set_connection(&self, state: ConnectionState) {
        *self.connection.lock() = state;
    }

    pub fn end(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl WatchdogSession for HostSession {
    fn local_site(&self) -> Uuid {
        self.site
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.lock()
    }

    fn locally_open(&self) -> Result<BTreeSet<DocPath>, SessionError> {
        Ok(self.locally_open.lock().clone())
    }

    fn remotely_open(&self) -> Result<BTreeSet<DocPath>, SessionError> {
        Ok(self.remotely_open.lock().clone())
    }

    fn read_document(&self, path: &DocPath) -> Result<DocumentSnapshot, SessionError> {
        let documents = self.documents.lock();
        let content = documents.get(path).cloned();
        let clocks = self.relay.clocks(path);
        Ok(DocumentSnapshot { content, clocks })
    }
}

pub struct ClientSite {
    pub registry: Arc<JupiterRegistry>,
    pub checker: ConsistencyChecker,
    pub documents: BTreeMap<DocPath, String>,
    pub inbox: VecDeque<JupiterActivity>,
}

impl ClientSite {
    pub fn id(&self) -> Uuid {
        self.registry.local_site()
    }

    pub fn content(&self, path: &DocPath) -> Option<&str> {
        self.documents.get(path).map(String::as_str)
    }

    pub fn check(&self, dispatch: &ChecksumDispatch) -> ChecksumVerdict {
        assert!(dispatch.is_for(&self.id()));
        let path = &dispatch.checksum.path;
        self.checker.check(&dispatch.checksum, self.content(path))
    }
}

/// One host and `n` clients, all starting from the same documents.
pub struct Star {
    pub host: Arc<HostSession>,
    pub clients: Vec<ClientSite>,
    /// (client, path) channels found broken while delivering
    pub diverged: BTreeSet<(usize, DocPath)>,
    host_inbox: VecDeque<JupiterActivity>,
}

impl Star {
    pub fn new(clients: usize, documents: &[(&str, &str)]) -> Self {
        let host = Arc::new(HostSession::new());
        for (path, content) in documents {
            let path = DocPath::new(*path);
            host.documents.lock().insert(path.clone(), content.to_string());
            host.remotely_open.lock().insert(path);
        }

        let clients = (0..clients)
            .map(|_| {
                let registry = Arc::new(JupiterRegistry::new(Uuid::new_v4()));
                host.relay.add_client(registry.local_site());
                ClientSite {
                    checker: ConsistencyChecker::new(registry.clone()),
                    registry,
                    documents: documents
                        .iter()
                        .map(|(path, content)| (DocPath::new(*path), content.to_string()))
                        .collect(),
                    inbox: VecDeque::new(),
                }
            })
            .collect();

        Self {
            host,
            clients,
            diverged: BTreeSet::new(),
            host_inbox: VecDeque::new(),
        }
    }

    fn client_index(&self, id: Uuid) -> usize {
        self.clients
            .iter()
            .position(|c| c.id() == id)
            .expect("recipient is a client")
    }

    /// Apply a local edit at client `i` and queue it for the host.
    pub fn client_edit(&mut self, i: usize, path: &str, operation: Operation) {
        let path = DocPath::new(path);
        let client = &mut self.clients[i];
        let doc = client.documents.entry(path.clone()).or_default();
        *doc = operation.apply(doc).expect("local edit applies");
        let activity = client.registry.generate(&path, operation);
        self.host_inbox.push_back(activity);
    }

    /// Apply a local edit at the host and queue it for every client.
    pub fn host_edit(&mut self, path: &str, operation: Operation) {
        let path = DocPath::new(path);
        let outbound = {
            let mut documents = self.host.documents.lock();
            let doc = documents.entry(path.clone()).or_default();
            *doc = operation.apply(doc).expect("host edit applies");
            self.host.relay.generate(&path, operation)
        };
        for out in outbound {
            let i = self.client_index(out.recipient);
            self.clients[i].inbox.push_back(out.activity);
        }
    }

    /// Deliver the next client activity to the host.
    ///
    /// An activity that does not apply on the host's copy is not relayed;
    /// its sender is recorded in `diverged`.
    pub fn deliver_to_host(&mut self) -> bool {
        let Some(activity) = self.host_inbox.pop_front() else {
            return false;
        };
        let sender = activity.source;
        let path = activity.path.clone();
        let result = {
            let mut documents = self.host.documents.lock();
            let doc = documents.entry(path.clone()).or_default();
            self.host.relay.receive_with(activity, |op| {
                *doc = op.apply(doc)?;
                Ok(())
            })
        };
        match result {
            Ok(relayed) => {
                for out in relayed.outbound {
                    let i = self.client_index(out.recipient);
                    self.clients[i].inbox.push_back(out.activity);
                }
            }
            Err(HostError::Apply { .. }) => {
                let i = self.client_index(sender);
                self.diverged.insert((i, path));
            }
            Err(e) => panic!("host rejected activity: {e}"),
        }
        true
    }

    pub fn deliver_to_client(&mut self, i: usize) -> bool {
        let client = &mut self.clients[i];
        let Some(activity) = client.inbox.pop_front() else {
            return false;
        };
        let path = activity.path.clone();
        let applied = match client.registry.apply_incoming(activity) {
            Ok(operation) => {
                let doc = client.documents.entry(path.clone()).or_default();
                operation.apply(doc).map(|updated| *doc = updated).is_ok()
            }
            Err(_) => false,
        };
        if !applied {
            client.registry.reset_one(&path);
            self.diverged.insert((i, path));
        }
        true
    }

    /// Restart client `i`'s channel for `path` from the host's copy.
    ///
    /// Activities still queued on the old channel are dropped.
    pub fn resync(&mut self, i: usize, path: &str) {
        let path = DocPath::new(path);
        let id = self.clients[i].id();
        let content = {
            let documents = self.host.documents.lock();
            self.host.relay.reset_client_document(&id, &path);
            documents.get(&path).cloned().unwrap_or_default()
        };

        let client = &mut self.clients[i];
        client.registry.reset_one(&path);
        client.documents.insert(path.clone(), content);
        client.inbox.retain(|activity| activity.path != path);
        self.host_inbox
            .retain(|activity| !(activity.source == id && activity.path == path));
        self.diverged.remove(&(i, path));
    }

    /// Deliver until every queue is empty.
    pub fn flush(&mut self) {
        loop {
            let mut progressed = false;
            while self.deliver_to_host() {
                progressed = true;
            }
            for i in 0..self.clients.len() {
                while self.deliver_to_client(i) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    pub fn assert_converged(&self, path: &str) {
        let path = DocPath::new(path);
        let host = self.host.content(&path);
        for client in &self.clients {
            assert_eq!(
                client.content(&path),
                host.as_deref(),
                "client {} diverged on {path}",
                client.id()
            );
        }
    }
}
