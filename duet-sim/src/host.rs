//! The simulated host: canonical documents, the Jupiter relay and the
//! consistency watchdog's view of the session.
//!
//! Once every client has made its edits the host keeps serving until each
//! client has confirmed, through a consistent checksum verdict, the state
//! the host currently holds for every document.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duet_collab::{
    Activity, ChecksumActivity, ChecksumDispatch, ChecksumVerdict, ConnectionState, DocPath,
    DocumentDigest, DocumentSnapshot, HostError, JupiterActivity, JupiterHost, SessionError,
    WatchdogSession,
};
use duet_core::Timestamp;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::network::{DelayedLink, Downstream, Upstream};

pub struct SimHost {
    site: Uuid,
    relay: JupiterHost,
    documents: Mutex<BTreeMap<DocPath, String>>,
    open: BTreeSet<DocPath>,
    active: AtomicBool,
}

impl SimHost {
    pub fn new(documents: BTreeMap<DocPath, String>) -> Self {
        let site = Uuid::new_v4();
        Self {
            site,
            relay: JupiterHost::new(site),
            open: documents.keys().cloned().collect(),
            documents: Mutex::new(documents),
            active: AtomicBool::new(true),
        }
    }

    pub fn relay(&self) -> &JupiterHost {
        &self.relay
    }

    pub fn documents(&self) -> BTreeMap<DocPath, String> {
        self.documents.lock().clone()
    }

    pub fn end(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Whether `checksum` still describes the host's copy and `client`'s
    /// channel.
    fn describes_current_state(&self, client: &Uuid, checksum: &ChecksumActivity) -> bool {
        let documents = self.documents.lock();
        let digest = DocumentDigest::of_optional(documents.get(&checksum.path).map(String::as_str));
        let clock = self
            .relay
            .timestamp(client, &checksum.path)
            .unwrap_or(Timestamp::ZERO);
        checksum.digest() == digest && checksum.timestamp.unwrap_or(Timestamp::ZERO) == clock
    }
}

impl WatchdogSession for SimHost {
    fn local_site(&self) -> Uuid {
        self.site
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_active() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn locally_open(&self) -> Result<BTreeSet<DocPath>, SessionError> {
        Ok(self.open.clone())
    }

    fn remotely_open(&self) -> Result<BTreeSet<DocPath>, SessionError> {
        Ok(self.open.clone())
    }

    fn read_document(&self, path: &DocPath) -> Result<DocumentSnapshot, SessionError> {
        let documents = self.documents.lock();
        Ok(DocumentSnapshot {
            content: documents.get(path).cloned(),
            clocks: self.relay.clocks(path),
        })
    }
}

#[derive(Debug, Default)]
pub struct HostReport {
    pub relayed: u64,
    pub rejected: u64,
    pub failed_applies: u64,
    pub resyncs: u64,
    pub checksums_sent: u64,
    pub verdicts: u64,
    /// Every client confirmed the final state before the timeout.
    pub settled: bool,
}

/// Host-side view of which clients are known to hold the current state.
#[derive(Default)]
struct Confirmations {
    /// Latest consistent checksum per (client, document)
    consistent: HashMap<(Uuid, DocPath), ChecksumActivity>,
}

impl Confirmations {
    fn record(&mut self, client: Uuid, checksum: ChecksumActivity, verdict: ChecksumVerdict) {
        let key = (client, checksum.path.clone());
        match verdict {
            ChecksumVerdict::Consistent => {
                self.consistent.insert(key, checksum);
            }
            ChecksumVerdict::Inconsistent => {
                self.consistent.remove(&key);
            }
            ChecksumVerdict::Deferred => {}
        }
    }

    fn forget(&mut self, client: Uuid, path: &DocPath) {
        self.consistent.remove(&(client, path.clone()));
    }

    fn all_current(&self, host: &SimHost, mut clients: impl Iterator<Item = Uuid>) -> bool {
        let paths: Vec<DocPath> = host.open.iter().cloned().collect();
        clients.all(|client| {
            paths.iter().all(|path| {
                self.consistent
                    .get(&(client, path.clone()))
                    .is_some_and(|checksum| host.describes_current_state(&client, checksum))
            })
        })
    }
}

/// Drive the host until every client is done and has confirmed the final
/// state, or until `settle_timeout` passes after the last client is done.
pub async fn run_host(
    host: Arc<SimHost>,
    mut inbound: mpsc::UnboundedReceiver<Upstream>,
    links: HashMap<Uuid, DelayedLink<Downstream>>,
    mut checksums: broadcast::Receiver<Arc<ChecksumDispatch>>,
    settle_timeout: Duration,
) -> HostReport {
    let mut report = HostReport::default();
    let mut confirmations = Confirmations::default();
    let mut done = BTreeSet::new();
    let mut deadline: Option<Instant> = None;

    loop {
        if deadline.is_some() && confirmations.all_current(&host, links.keys().copied()) {
            report.settled = true;
            log::info!("Every client confirmed the final state");
            break;
        }

        let give_up = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(Upstream::Activity(bytes)) => {
                    handle_activity(&host, &links, &bytes, &mut confirmations, &mut report)
                }
                Some(Upstream::Resync { client, path }) => {
                    confirmations.forget(client, &path);
                    resync(&host, &links, client, path);
                    report.resyncs += 1;
                }
                Some(Upstream::Verdict { client, checksum, verdict }) => {
                    confirmations.record(client, checksum, verdict);
                    report.verdicts += 1;
                }
                Some(Upstream::Done(client)) => {
                    done.insert(client);
                    log::debug!("Client {client} done ({}/{})", done.len(), links.len());
                    if done.len() == links.len() {
                        deadline = Some(Instant::now() + settle_timeout);
                    }
                }
                None => break,
            },
            dispatch = checksums.recv() => match dispatch {
                Ok(dispatch) => report.checksums_sent += send_checksum(&links, &dispatch),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Host skipped {skipped} checksums");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
            _ = give_up => {
                log::warn!("Clients did not confirm the final state within {settle_timeout:?}");
                break;
            }
        }
    }

    for link in links.values() {
        link.send(Downstream::Shutdown);
    }
    report
}

fn handle_activity(
    host: &SimHost,
    links: &HashMap<Uuid, DelayedLink<Downstream>>,
    bytes: &[u8],
    confirmations: &mut Confirmations,
    report: &mut HostReport,
) {
    let activity = match Activity::decode(bytes) {
        Ok(Activity::Jupiter(activity)) => activity,
        Ok(Activity::Checksum(checksum)) => {
            log::warn!("Host ignores checksum from client: {checksum}");
            return;
        }
        Err(e) => {
            log::error!("Undecodable activity: {e}");
            return;
        }
    };

    let sender = activity.source;
    let path = activity.path.clone();
    let result = {
        let mut documents = host.documents.lock();
        let doc = documents.entry(path.clone()).or_default();
        host.relay.receive_with(activity, |op| {
            *doc = op.apply(doc)?;
            Ok(())
        })
    };

    match result {
        Ok(relayed) => {
            report.relayed += 1;
            for out in relayed.outbound {
                send_activity(links, out.recipient, out.activity);
            }
        }
        Err(HostError::Apply { .. }) => {
            // The sender's proxy is gone; it must come back through a resync
            report.failed_applies += 1;
            confirmations.forget(sender, &path);
            if let Some(link) = links.get(&sender) {
                link.send(Downstream::Diverged { path });
            }
        }
        Err(e) => {
            // Sent on a channel the host has already dropped
            log::debug!("{e}");
            report.rejected += 1;
        }
    }
}

fn send_activity(links: &HashMap<Uuid, DelayedLink<Downstream>>, recipient: Uuid, activity: JupiterActivity) {
    let Some(link) = links.get(&recipient) else {
        return;
    };
    match Activity::from(activity).encode() {
        Ok(bytes) => {
            link.send(Downstream::Activity(bytes));
        }
        Err(e) => log::error!("Failed to encode activity for {recipient}: {e}"),
    }
}

fn send_checksum(links: &HashMap<Uuid, DelayedLink<Downstream>>, dispatch: &ChecksumDispatch) -> u64 {
    let bytes = match Activity::from(dispatch.checksum.clone()).encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Failed to encode checksum: {e}");
            return 0;
        }
    };

    let mut sent = 0;
    for (peer, link) in links {
        if dispatch.is_for(peer) && link.send(Downstream::Activity(bytes.clone())) {
            sent += 1;
        }
    }
    sent
}

/// Restart the channel with `client` for `path` from the host's copy.
fn resync(host: &SimHost, links: &HashMap<Uuid, DelayedLink<Downstream>>, client: Uuid, path: DocPath) {
    let content = {
        let documents = host.documents.lock();
        host.relay.reset_client_document(&client, &path);
        documents.get(&path).cloned().unwrap_or_default()
    };
    log::info!("Resynchronizing {path} for {client}");
    if let Some(link) = links.get(&client) {
        link.send(Downstream::Snapshot { path, content });
    }
}
