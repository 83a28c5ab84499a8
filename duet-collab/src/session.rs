//! What the consistency watchdog needs from the surrounding session.

use std::collections::BTreeSet;

use duet_core::Timestamp;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::DocPath;

/// Connection state of the local site to the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("failed to read {path}: {reason}")]
    Read { path: DocPath, reason: String },
    #[error("editor bookkeeping unavailable: {0}")]
    Bookkeeping(String),
}

/// Canonical state of one document at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSnapshot {
    /// `None` when the document does not exist.
    pub content: Option<String>,
    /// Clock of each client's channel for this document, read in the same
    /// critical section as `content`. Empty on sites that are not the host.
    pub clocks: Vec<(Uuid, Timestamp)>,
}

impl DocumentSnapshot {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn of(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            clocks: Vec::new(),
        }
    }

    pub fn with_clocks(self, clocks: Vec<(Uuid, Timestamp)>) -> Self {
        Self { clocks, ..self }
    }
}

/// Session facade queried once per watchdog cycle.
///
/// Implementations must not call back into the watchdog.
pub trait WatchdogSession: Send + Sync + 'static {
    fn local_site(&self) -> Uuid;

    fn is_active(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// Documents open in an editor at this site.
    fn locally_open(&self) -> Result<BTreeSet<DocPath>, SessionError>;

    /// Documents open in an editor at any other site.
    fn remotely_open(&self) -> Result<BTreeSet<DocPath>, SessionError>;

    /// Canonical content of `path` with the channel clocks it corresponds to.
    ///
    /// Open documents are read from their editor buffer, others from disk.
    fn read_document(&self, path: &DocPath) -> Result<DocumentSnapshot, SessionError>;
}
