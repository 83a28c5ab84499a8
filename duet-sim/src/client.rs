//! A simulated client: random local edits, incoming activities and checksum
//! verdicts, and resynchronization on divergence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use duet_collab::{Activity, ChecksumVerdict, ConsistencyChecker, DocPath, JupiterRegistry};
use duet_core::{char_len, Operation};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::network::{DelayedLink, Downstream, Upstream};

#[derive(Debug, Default)]
pub struct ClientReport {
    pub documents: BTreeMap<DocPath, String>,
    pub edits: u64,
    pub skipped_edits: u64,
    pub applied: u64,
    pub consistent: u64,
    pub inconsistent: u64,
    pub deferred: u64,
    pub resyncs: u64,
}

pub struct SimClient {
    id: Uuid,
    registry: Arc<JupiterRegistry>,
    checker: ConsistencyChecker,
    documents: BTreeMap<DocPath, String>,
    /// Paths whose channel was dropped and whose snapshot has not arrived.
    awaiting: BTreeSet<DocPath>,
    upstream: DelayedLink<Upstream>,
    rng: StdRng,
    report: ClientReport,
}

impl SimClient {
    pub fn new(
        id: Uuid,
        documents: BTreeMap<DocPath, String>,
        upstream: DelayedLink<Upstream>,
        seed: u64,
    ) -> Self {
        let registry = Arc::new(JupiterRegistry::new(id));
        Self {
            id,
            checker: ConsistencyChecker::new(registry.clone()),
            registry,
            documents,
            awaiting: BTreeSet::new(),
            upstream,
            rng: StdRng::seed_from_u64(seed),
            report: ClientReport::default(),
        }
    }

    /// Make `edits` edits, then keep serving the host until shutdown.
    ///
    /// With `corrupt_at`, that edit is applied locally but never sent.
    pub async fn run(
        mut self,
        mut downstream: mpsc::UnboundedReceiver<Downstream>,
        edits: usize,
        pace: Duration,
        corrupt_at: Option<usize>,
    ) -> ClientReport {
        let mut made = 0;
        let pace_micros = pace.as_micros() as u64;
        if edits == 0 {
            self.upstream.send(Upstream::Done(self.id));
        }

        loop {
            let pause = Duration::from_micros(self.rng.gen_range(0..=pace_micros));
            tokio::select! {
                msg = downstream.recv() => match msg {
                    Some(Downstream::Activity(bytes)) => self.handle_activity(&bytes),
                    Some(Downstream::Snapshot { path, content }) => self.handle_snapshot(path, content),
                    Some(Downstream::Diverged { path }) => {
                        log::warn!("Host could not apply an edit of {} to {path}", self.id);
                        self.start_resync(path);
                    }
                    Some(Downstream::Shutdown) | None => break,
                },
                _ = tokio::time::sleep(pause), if made < edits => {
                    if corrupt_at == Some(made) {
                        self.corrupt();
                    } else {
                        self.edit();
                    }
                    made += 1;
                    if made == edits {
                        self.upstream.send(Upstream::Done(self.id));
                    }
                }
            }
        }

        self.report.documents = self.documents;
        self.report
    }

    fn random_path(&mut self) -> Option<DocPath> {
        self.documents.keys().choose(&mut self.rng).cloned()
    }

    fn edit(&mut self) {
        let Some(path) = self.random_path() else {
            return;
        };
        if self.awaiting.contains(&path) {
            self.report.skipped_edits += 1;
            return;
        }

        let doc = self.documents.get(&path).map(String::as_str).unwrap_or("");
        let operation = random_edit(&mut self.rng, doc);
        if operation.is_noop() {
            return;
        }
        let updated = match operation.apply(doc) {
            Ok(updated) => updated,
            Err(e) => {
                log::error!("Generated edit does not apply: {e}");
                return;
            }
        };
        self.documents.insert(path.clone(), updated);

        let activity = self.registry.generate(&path, operation);
        match Activity::from(activity).encode() {
            Ok(bytes) => {
                self.upstream.send(Upstream::Activity(bytes));
                self.report.edits += 1;
            }
            Err(e) => log::error!("Failed to encode edit: {e}"),
        }
    }

    /// Change the local copy behind the channel's back.
    fn corrupt(&mut self) {
        let Some(path) = self.random_path() else {
            return;
        };
        log::warn!("Client {} corrupts its copy of {path}", self.id);
        if let Some(doc) = self.documents.get_mut(&path) {
            doc.push('#');
        }
    }

    fn handle_activity(&mut self, bytes: &[u8]) {
        match Activity::decode(bytes) {
            Ok(Activity::Jupiter(activity)) => {
                let path = activity.path.clone();
                if self.awaiting.contains(&path) {
                    log::trace!("Client {} drops activity for resyncing {path}", self.id);
                    return;
                }
                let result = self.registry.apply_incoming(activity);
                let doc = self.documents.entry(path.clone()).or_default();
                match result.map(|op| op.apply(doc)) {
                    Ok(Ok(updated)) => {
                        *doc = updated;
                        self.report.applied += 1;
                    }
                    Ok(Err(e)) => {
                        log::warn!("Client {} cannot apply to {path}: {e}", self.id);
                        self.start_resync(path);
                    }
                    Err(e) => {
                        log::warn!("Client {} lost sync on {path}: {e}", self.id);
                        self.start_resync(path);
                    }
                }
            }
            Ok(Activity::Checksum(checksum)) => {
                if self.awaiting.contains(&checksum.path) {
                    return;
                }
                let local = self.documents.get(&checksum.path).map(String::as_str);
                let verdict = self.checker.check(&checksum, local);
                let path = checksum.path.clone();
                self.upstream.send(Upstream::Verdict {
                    client: self.id,
                    checksum,
                    verdict,
                });
                match verdict {
                    ChecksumVerdict::Consistent => self.report.consistent += 1,
                    ChecksumVerdict::Deferred => self.report.deferred += 1,
                    ChecksumVerdict::Inconsistent => {
                        self.report.inconsistent += 1;
                        self.start_resync(path);
                    }
                }
            }
            Err(e) => log::error!("Client {} got undecodable activity: {e}", self.id),
        }
    }

    fn start_resync(&mut self, path: DocPath) {
        if !self.awaiting.insert(path.clone()) {
            return;
        }
        self.registry.reset_one(&path);
        self.report.resyncs += 1;
        self.upstream.send(Upstream::Resync {
            client: self.id,
            path,
        });
    }

    fn handle_snapshot(&mut self, path: DocPath, content: String) {
        log::debug!("Client {} resynchronized {path}", self.id);
        self.registry.reset_one(&path);
        self.documents.insert(path.clone(), content);
        self.awaiting.remove(&path);
    }
}

/// Replace up to three characters at a random position with up to three
/// random letters.
fn random_edit(rng: &mut StdRng, doc: &str) -> Operation {
    let len = char_len(doc);
    let position = rng.gen_range(0..=len);
    let delete = rng.gen_range(0..=3).min(len - position);
    let deleted: String = doc.chars().skip(position).take(delete).collect();
    let inserted: String = (0..rng.gen_range(0..=3))
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect();
    Operation::replace(position, deleted, inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_collab::{ChecksumActivity, DocumentDigest};
    use duet_core::Timestamp;

    #[test]
    fn test_random_edits_apply() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut doc = String::from("héllo wörld");
        for _ in 0..500 {
            let op = random_edit(&mut rng, &doc);
            doc = op.apply(&doc).unwrap();
        }
    }

    #[tokio::test]
    async fn test_snapshot_ends_resync() {
        let (up, _up_rx) = mpsc::unbounded_channel();
        let link = DelayedLink::spawn(up, Duration::ZERO, 0);
        let path = DocPath::new("doc");
        let mut client = SimClient::new(
            Uuid::new_v4(),
            BTreeMap::from([(path.clone(), "local".to_string())]),
            link,
            3,
        );

        client.start_resync(path.clone());
        client.start_resync(path.clone());
        assert_eq!(client.report.resyncs, 1);
        assert!(client.awaiting.contains(&path));

        client.edit();
        assert_eq!(client.report.skipped_edits, 1);

        client.handle_snapshot(path.clone(), "canonical".into());
        assert!(client.awaiting.is_empty());
        assert_eq!(client.documents[&path], "canonical");
    }

    #[tokio::test]
    async fn test_verdict_precedes_resync() {
        let (up, mut up_rx) = mpsc::unbounded_channel();
        let link = DelayedLink::spawn(up, Duration::ZERO, 0);
        let path = DocPath::new("doc");
        let id = Uuid::new_v4();
        let mut client = SimClient::new(id, BTreeMap::from([(path.clone(), "local".to_string())]), link, 5);

        let checksum = ChecksumActivity::new(Uuid::nil(), path.clone(), DocumentDigest::of("host"))
            .with_timestamp(Timestamp::ZERO);
        client.handle_activity(&Activity::from(checksum.clone()).encode().unwrap());

        match up_rx.recv().await {
            Some(Upstream::Verdict { client: from, checksum: judged, verdict }) => {
                assert_eq!(from, id);
                assert_eq!(judged, checksum);
                assert_eq!(verdict, ChecksumVerdict::Inconsistent);
            }
            other => panic!("Expected verdict, got {other:?}"),
        }
        assert!(matches!(up_rx.recv().await, Some(Upstream::Resync { path: p, .. }) if p == path));
        assert_eq!(client.report.inconsistent, 1);
    }

    #[tokio::test]
    async fn test_diverged_notice_starts_resync() {
        let (up, mut up_rx) = mpsc::unbounded_channel();
        let link = DelayedLink::spawn(up, Duration::ZERO, 0);
        let (down, down_rx) = mpsc::unbounded_channel();
        let path = DocPath::new("doc");
        let client = SimClient::new(Uuid::new_v4(), BTreeMap::from([(path.clone(), "local".to_string())]), link, 9);

        down.send(Downstream::Diverged { path: path.clone() }).unwrap();
        // A second notice for the same path is absorbed by the pending resync
        down.send(Downstream::Diverged { path: path.clone() }).unwrap();
        down.send(Downstream::Snapshot { path: path.clone(), content: "canonical".into() }).unwrap();
        down.send(Downstream::Shutdown).unwrap();

        let report = client.run(down_rx, 0, Duration::ZERO, None).await;
        assert_eq!(report.resyncs, 1);
        assert_eq!(report.documents[&path], "canonical");

        assert!(matches!(up_rx.recv().await, Some(Upstream::Done(_))));
        assert!(matches!(up_rx.recv().await, Some(Upstream::Resync { path: p, .. }) if p == path));
    }
}
