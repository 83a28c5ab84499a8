//! Host side of the consistency watchdog.
//!
//! Every `interval` the host digests each document open at any site and
//! dispatches one [`ChecksumActivity`] per client, stamped with that
//! client's channel clock. Documents that are no longer open anywhere are
//! forgotten.
//!
//! ```text
//!   ┌── initial_delay ──┐
//!   ▼                   │
//! cycle ──► Completed ──┴── interval ──────────► cycle
//!   │   └─► Disconnected ── disconnected_interval ─► cycle
//!   └─────► Inactive | Blocked | error | panic ── interval ─► cycle
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::checksum::{DocumentChecksum, DocumentDigest};
use crate::protocol::{ChecksumActivity, DocPath};
use crate::session::{ConnectionState, SessionError, WatchdogSession};
use crate::watchdog::gate::ExecutionState;

/// Watchdog timing.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Delay between cycles while connected
    pub interval: Duration,
    /// Delay after a cycle that found the session disconnected
    pub disconnected_interval: Duration,
    /// Delay before the first cycle
    pub initial_delay: Duration,
    /// Checksums buffered per subscriber
    pub broadcast_capacity: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            disconnected_interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(10),
            broadcast_capacity: 256,
        }
    }
}

impl WatchdogConfig {
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(10),
            disconnected_interval: Duration::from_millis(25),
            initial_delay: Duration::ZERO,
            broadcast_capacity: 64,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchdogError {
    #[error("consistency watchdog is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("checksum cycle panicked: {0}")]
    Panicked(String),
}

/// A checksum for one recipient, or for every site when `recipient` is
/// `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumDispatch {
    pub recipient: Option<Uuid>,
    pub checksum: ChecksumActivity,
}

impl ChecksumDispatch {
    pub fn is_for(&self, peer: &Uuid) -> bool {
        self.recipient.map_or(true, |recipient| recipient == *peer)
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The session has ended.
    Inactive,
    Disconnected,
    /// The execution gate was closed.
    Blocked,
    Completed(CycleReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub dispatches: Vec<ChecksumDispatch>,
    /// Documents tracked after the cycle.
    pub tracked: usize,
    /// Documents forgotten by the cycle.
    pub disposed: usize,
}

/// Digest bookkeeping across cycles.
#[derive(Debug, Default)]
pub struct ChecksumTracker {
    checksums: BTreeMap<DocPath, DocumentChecksum>,
}

impl ChecksumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_paths(&self) -> Vec<DocPath> {
        self.checksums.keys().cloned().collect()
    }

    pub fn checksum(&self, path: &DocPath) -> Option<&DocumentChecksum> {
        self.checksums.get(path)
    }

    pub fn dispose_all(&mut self) {
        self.checksums.clear();
    }

    /// One watchdog cycle.
    ///
    /// `execution` is read by the caller before the cycle starts; a blocked
    /// cycle touches nothing.
    pub fn run_cycle<S: WatchdogSession + ?Sized>(
        &mut self,
        session: &S,
        execution: ExecutionState,
    ) -> Result<CycleOutcome, WatchdogError> {
        if !session.is_active() {
            return Ok(CycleOutcome::Inactive);
        }
        if session.connection_state() != ConnectionState::Connected {
            return Ok(CycleOutcome::Disconnected);
        }
        if execution == ExecutionState::Blocked {
            return Ok(CycleOutcome::Blocked);
        }

        let local_site = session.local_site();
        let locally_open = session.locally_open()?;
        let remotely_open = session.remotely_open()?;

        let mut stale: BTreeSet<DocPath> = self.checksums.keys().cloned().collect();
        let mut dispatches = Vec::new();

        for path in locally_open.union(&remotely_open) {
            let snapshot = match session.read_document(path) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("Skipping checksum of {path}: {e}");
                    stale.remove(path);
                    continue;
                }
            };

            if snapshot.content.is_none() {
                if locally_open.contains(path) {
                    log::error!("{path} is open in a local editor but does not exist");
                }
                if !remotely_open.contains(path) {
                    continue;
                }
            }
            stale.remove(path);

            let digest = DocumentDigest::of_optional(snapshot.content.as_deref());
            let checksum = self
                .checksums
                .entry(path.clone())
                .or_insert_with(|| DocumentChecksum::new(path.clone()));
            if checksum.update(digest) {
                log::trace!("Checksum of {path} is now {digest}");
            }

            let activity = ChecksumActivity::new(local_site, path.clone(), digest);
            if snapshot.clocks.is_empty() {
                dispatches.push(ChecksumDispatch {
                    recipient: None,
                    checksum: activity,
                });
            } else {
                dispatches.extend(snapshot.clocks.into_iter().map(|(peer, timestamp)| {
                    ChecksumDispatch {
                        recipient: Some(peer),
                        checksum: activity.clone().with_timestamp(timestamp),
                    }
                }));
            }
        }

        for path in &stale {
            self.checksums.remove(path);
            log::debug!("No longer tracking {path}");
        }

        Ok(CycleOutcome::Completed(CycleReport {
            dispatches,
            tracked: self.checksums.len(),
            disposed: stale.len(),
        }))
    }
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic checksum task of the host.
pub struct ConsistencyWatchdog {
    config: WatchdogConfig,
    broadcast: Arc<BroadcastGroup<ChecksumDispatch>>,
    tracker: Arc<Mutex<ChecksumTracker>>,
    cycles: Arc<AtomicU64>,
    running: Mutex<Option<RunningTask>>,
}

impl ConsistencyWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        Self {
            config,
            broadcast,
            tracker: Arc::new(Mutex::new(ChecksumTracker::new())),
            cycles: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup<ChecksumDispatch>> {
        &self.broadcast
    }

    /// Receiver for every checksum the watchdog dispatches.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChecksumDispatch>> {
        self.broadcast.subscribe()
    }

    /// Cycles run since creation, including skipped ones.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn tracked_paths(&self) -> Vec<DocPath> {
        self.tracker.lock().tracked_paths()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the periodic task on the current tokio runtime.
    pub fn start<S: WatchdogSession>(
        &self,
        session: Arc<S>,
        execution: watch::Receiver<ExecutionState>,
    ) -> Result<(), WatchdogError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(WatchdogError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watchdog(
            session,
            execution,
            self.config.clone(),
            self.tracker.clone(),
            self.broadcast.clone(),
            self.cycles.clone(),
            cancel.clone(),
        ));
        *running = Some(RunningTask { cancel, handle });
        log::info!("Consistency watchdog started");
        Ok(())
    }

    /// Cancel the task, wait for it to finish and forget all checksums.
    ///
    /// Once this returns the watchdog holds no reference to the session.
    pub async fn stop(&self) -> bool {
        let task = self.running.lock().take();
        let Some(task) = task else {
            return false;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            log::error!("Consistency watchdog task failed: {e}");
        }
        self.tracker.lock().dispose_all();
        log::info!("Consistency watchdog stopped");
        true
    }
}

async fn run_watchdog<S: WatchdogSession>(
    session: Arc<S>,
    execution: watch::Receiver<ExecutionState>,
    config: WatchdogConfig,
    tracker: Arc<Mutex<ChecksumTracker>>,
    broadcast: Arc<BroadcastGroup<ChecksumDispatch>>,
    cycles: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut delay = config.initial_delay;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        // Document reads may block
        let state = *execution.borrow();
        let cycle_session = session.clone();
        let cycle_tracker = tracker.clone();
        let result = tokio::task::spawn_blocking(move || {
            cycle_tracker.lock().run_cycle(&*cycle_session, state)
        })
        .await
        .unwrap_or_else(|e| {
            if e.is_panic() {
                Err(WatchdogError::Panicked(panic_message(e.into_panic().as_ref())))
            } else {
                Err(WatchdogError::Panicked(e.to_string()))
            }
        });
        cycles.fetch_add(1, Ordering::Relaxed);

        delay = match result {
            Ok(CycleOutcome::Completed(report)) => {
                log::trace!(
                    "Checksum cycle: {} dispatched, {} tracked, {} disposed",
                    report.dispatches.len(),
                    report.tracked,
                    report.disposed
                );
                for dispatch in report.dispatches {
                    broadcast.broadcast(dispatch);
                }
                config.interval
            }
            Ok(CycleOutcome::Disconnected) => {
                log::debug!("Session disconnected, delaying checksum cycle");
                config.disconnected_interval
            }
            Ok(outcome) => {
                log::trace!("Checksum cycle skipped: {outcome:?}");
                config.interval
            }
            Err(e) => {
                log::error!("Internal error in consistency watchdog: {e}");
                config.interval
            }
        };
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
