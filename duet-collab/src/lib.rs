//! # duet-collab: session layer for shared text editing
//!
//! Wires the Jupiter channels of `duet-core` into a star topology and keeps
//! every copy of every shared document in check.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   JupiterActivity   ┌──────────────────┐
//! │ JupiterRegistry│ ◄─────────────────► │ JupiterHost      │
//! │ (per client)   │                     │ (proxy per peer) │
//! └───────┬────────┘                     └────────┬─────────┘
//!         │                                       │
//!         ▼         ChecksumActivity              ▼
//! ┌────────────────────┐ (per client) ┌─────────────────────┐
//! │ ConsistencyChecker │ ◄─────────── │ ConsistencyWatchdog │
//! │ (inconsistent set) │              │ (periodic task)     │
//! └────────────────────┘              └──────────┬──────────┘
//!                                                │
//!                                       ┌────────┴───────┐
//!                                       │ BroadcastGroup │
//!                                       │ (fan-out)      │
//!                                       └────────────────┘
//! ```
//!
//! Transport, editor buffers and resynchronization are the embedding
//! session's job; see [`session::WatchdogSession`].
//!
//! ## Modules
//!
//! - [`protocol`]: activities and their bincode wire format
//! - [`checksum`]: document digests
//! - [`registry`]: client-side path → Jupiter map
//! - [`host`]: host-side relay with one proxy per client
//! - [`broadcast`]: session-wide fan-out with backpressure
//! - [`session`]: what the watchdog needs from the session
//! - [`watchdog`]: periodic checksum exchange

pub mod broadcast;
pub mod checksum;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod watchdog;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use checksum::{DocumentChecksum, DocumentDigest};
pub use host::{HostError, JupiterHost, Outbound, Relayed};
pub use protocol::{
    Activity, ChecksumActivity, DocPath, JupiterActivity, ProtocolError, NON_EXISTING_DOC,
};
pub use registry::JupiterRegistry;
pub use session::{ConnectionState, DocumentSnapshot, SessionError, WatchdogSession};
pub use watchdog::{
    ChecksumDispatch, ChecksumTracker, ChecksumVerdict, ConsistencyChecker, ConsistencyWatchdog,
    CycleOutcome, CycleReport, ExecutionGate, ExecutionState, WatchdogConfig, WatchdogError,
};
