//! # driftchat-room: the per-room state machine
//!
//! [`RoomState`] is the pure, deterministic core that committed
//! operations are applied to. No I/O, no clocks, no randomness: given
//! the same ordered sequence of messages, two independent instances
//! reach byte-identical `head_hash` values and equal message sequences.
//! That determinism is what lets three replicas agree on room content by
//! agreeing only on log order.
//!
//! Replay after recovery goes through the same [`RoomState::apply`] as
//! live traffic, so recovery reproduces the identical state.

mod error;
mod room;

pub use error::RoomError;
pub use room::{ApplyResult, RoomState};
