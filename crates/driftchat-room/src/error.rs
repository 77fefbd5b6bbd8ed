//! Room state machine error types.

use driftchat_types::{OpNumber, RoomId};
use thiserror::Error;

/// Errors from applying an operation to a room.
///
/// The protocol layer treats these as protocol bugs (the primary should
/// never replicate an operation a room would reject) except for the
/// resource bounds, which surface as back-pressure to the edge.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    /// Operations must be applied in exactly assigned order.
    #[error("non-sequential op {op} (room last_op {last_op})")]
    NonSequentialOp { op: OpNumber, last_op: OpNumber },

    /// A message addressed to another room reached this state machine.
    #[error("message for room {got} applied to room {expected}")]
    WrongRoom { expected: RoomId, got: RoomId },

    /// Assigned timestamps never move backward within a room.
    #[error("timestamp {timestamp_us} before room watermark {last_timestamp_us}")]
    TimestampNotMonotonic {
        timestamp_us: u64,
        last_timestamp_us: u64,
    },

    /// The room holds the maximum number of messages.
    #[error("room full")]
    RoomFull,

    /// The idempotency table holds the maximum number of entries.
    #[error("idempotency table full")]
    IdempotencyTableFull,
}
