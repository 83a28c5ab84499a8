//! Periodic checksum exchange that detects divergent document copies.
//!
//! ```text
//!   host                                         client
//!  ┌────────────────────┐  ChecksumActivity  ┌─────────────────────────┐
//!  │ ConsistencyWatchdog│ ─────────────────► │ ConsistencyChecker      │
//!  │  every interval:   │  (stamped per      │  stale?  → Deferred     │
//!  │  digest open docs  │   recipient)       │  equal?  → Consistent   │
//!  └────────────────────┘                    │  else    → Inconsistent │
//!                                            │            reset_one    │
//!                                            └─────────────────────────┘
//! ```
//!
//! - [`host`]: the periodic task and the per-cycle bookkeeping
//! - [`client`]: comparison against the local copy and the inconsistent set
//! - [`gate`]: explicit pause state shared with the session

pub mod client;
pub mod gate;
pub mod host;

pub use client::{ChecksumVerdict, ConsistencyChecker};
pub use gate::{ExecutionGate, ExecutionState};
pub use host::{
    ChecksumDispatch, ChecksumTracker, ConsistencyWatchdog, CycleOutcome, CycleReport,
    WatchdogConfig, WatchdogError,
};
