//! Jupiter: two-site operational transformation over one channel.
//!
//! ```text
//!   client (Role::Client)                      host proxy (Role::Server)
//!  ┌──────────────────────┐   stamped ops     ┌──────────────────────┐
//!  │ [local, remote]      │ ────────────────► │ [local, remote]      │
//!  │ outstanding: a1 a2.. │ ◄──────────────── │ outstanding: b1 ..   │
//!  └──────────────────────┘                   └──────────────────────┘
//! ```
//!
//! Each side keeps the operations it generated that the other side has not
//! acknowledged yet. An incoming operation is transformed against exactly
//! those, so both sides apply the same edits in different but convergent
//! orders. The host runs one server-role channel per client and relays.
//!
//! Reference: Nichols et al.: High-Latency, Low-Bandwidth Windowing in the
//! Jupiter Collaboration System (UIST 1995)

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::operation::{Operation, Tie};
use crate::timestamp::Timestamp;

/// Which end of the channel this instance is.
///
/// Concurrent inserts at the same position are ordered by role: the
/// server-side text is always placed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

/// Observable lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No history: clocks at zero, nothing outstanding.
    Reset,
    Active,
}

/// Raised when an incoming timestamp does not fit the channel.
///
/// The message was lost, duplicated or reordered. There is no way to catch
/// up a channel in this condition; callers reset it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformationError {
    #[error("out-of-order operation: expected remote operation #{expected}, received #{received}")]
    OutOfOrder { expected: u64, received: u64 },
    #[error("operation acknowledges {acknowledged} local operations but only {generated} were generated")]
    UnknownAcknowledgement { acknowledged: u64, generated: u64 },
    #[error("stale acknowledgement {acknowledged}, already acknowledged {previous}")]
    StaleAcknowledgement { acknowledged: u64, previous: u64 },
}

impl TransformationError {
    /// The message is older than what the channel already processed
    /// (duplicate or late delivery) rather than ahead of it.
    pub fn is_stale(&self) -> bool {
        match self {
            TransformationError::OutOfOrder { expected, received } => received < expected,
            TransformationError::StaleAcknowledgement { .. } => true,
            TransformationError::UnknownAcknowledgement { .. } => false,
        }
    }
}

/// An operation tagged with the sender's channel clock at generation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampedOperation {
    pub timestamp: Timestamp,
    pub operation: Operation,
}

#[derive(Debug, Clone)]
struct Outstanding {
    /// Local count when the operation was generated.
    local: u64,
    operation: Operation,
}

/// One Jupiter channel endpoint.
#[derive(Debug, Clone)]
pub struct Jupiter {
    role: Role,
    vector_time: Timestamp,
    /// Highest acknowledgement received so far.
    acknowledged: u64,
    outstanding: VecDeque<Outstanding>,
}

impl Jupiter {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            vector_time: Timestamp::ZERO,
            acknowledged: 0,
            outstanding: VecDeque::new(),
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn timestamp(&self) -> Timestamp {
        self.vector_time
    }

    pub fn state(&self) -> ChannelState {
        if self.vector_time == Timestamp::ZERO && self.outstanding.is_empty() {
            ChannelState::Reset
        } else {
            ChannelState::Active
        }
    }

    /// Operations generated here and not yet acknowledged, oldest first.
    pub fn outstanding(&self) -> impl Iterator<Item = &Operation> {
        self.outstanding.iter().map(|o| &o.operation)
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Stamp a locally applied operation for sending.
    ///
    /// The caller has already applied `operation` to its buffer.
    pub fn generate(&mut self, operation: Operation) -> StampedOperation {
        let stamped = StampedOperation {
            timestamp: self.vector_time,
            operation: operation.clone(),
        };
        self.outstanding.push_back(Outstanding {
            local: self.vector_time.local,
            operation,
        });
        self.vector_time = self.vector_time.increment_local();
        log::trace!("jupiter {:?} generated {} at {}", self.role, stamped.operation, stamped.timestamp);
        stamped
    }

    /// Transform an incoming operation into one that applies to the local
    /// buffer.
    ///
    /// On error the channel is left exactly as it was.
    pub fn receive(&mut self, incoming: StampedOperation) -> Result<Operation, TransformationError> {
        let ts = incoming.timestamp;
        self.check_preconditions(ts)?;

        while self.outstanding.front().is_some_and(|o| o.local < ts.remote) {
            self.outstanding.pop_front();
        }
        self.acknowledged = ts.remote;

        // Incoming text from the server goes first at equal positions.
        let tie = match self.role {
            Role::Client => Tie::Before,
            Role::Server => Tie::After,
        };

        let mut operation = incoming.operation;
        for buffered in self.outstanding.iter_mut() {
            let (incoming_t, buffered_t) = operation.transform(&buffered.operation, tie);
            buffered.operation = buffered_t;
            operation = incoming_t;
        }

        self.vector_time = self.vector_time.increment_remote();
        log::trace!(
            "jupiter {:?} received {} at {}, now {} with {} outstanding",
            self.role,
            operation,
            ts,
            self.vector_time,
            self.outstanding.len()
        );
        Ok(operation)
    }

    fn check_preconditions(&self, ts: Timestamp) -> Result<(), TransformationError> {
        if ts.local != self.vector_time.remote {
            return Err(TransformationError::OutOfOrder {
                expected: self.vector_time.remote,
                received: ts.local,
            });
        }
        if ts.remote > self.vector_time.local {
            return Err(TransformationError::UnknownAcknowledgement {
                acknowledged: ts.remote,
                generated: self.vector_time.local,
            });
        }
        if ts.remote < self.acknowledged {
            return Err(TransformationError::StaleAcknowledgement {
                acknowledged: ts.remote,
                previous: self.acknowledged,
            });
        }
        Ok(())
    }

    /// Whether a checksum taken by the other end at `remote_time` describes
    /// exactly the state this endpoint has applied.
    ///
    /// False while operations are in flight in either direction; such a
    /// checksum cannot be compared yet.
    pub fn is_current(&self, remote_time: Timestamp) -> bool {
        remote_time.local == self.vector_time.remote && remote_time.remote == self.vector_time.local
    }

    /// Drop all history. Idempotent.
    pub fn reset(&mut self) {
        self.vector_time = Timestamp::ZERO;
        self.acknowledged = 0;
        self.outstanding.clear();
    }
}
