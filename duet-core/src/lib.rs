//! # duet-core: operational transformation for shared text
//!
//! Pure, synchronous building blocks of the collaboration layer:
//!
//! - [`operation`]: immutable text edits and their inclusion transform
//! - [`timestamp`]: the two-entry vector clock of a channel
//! - [`jupiter`]: the Jupiter channel state machine (client and server roles)
//!
//! Nothing here performs I/O or touches a document buffer; callers apply the
//! operations these types compute.

pub mod jupiter;
pub mod operation;
pub mod timestamp;

pub use jupiter::{ChannelState, Jupiter, Role, StampedOperation, TransformationError};
pub use operation::{char_len, Operation, OperationError, TextEdit, Tie};
pub use timestamp::Timestamp;
