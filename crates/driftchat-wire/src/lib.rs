//! # driftchat-wire: wire formats and signed transport
//!
//! The two fixed byte layouts everything else depends on, plus the
//! transport that authenticates them:
//!
//! - [`ChatMessage`]: the 2368-byte chat message record shared by the
//!   write-ahead log, the state machine, and `Prepare` bodies
//! - [`Header`] / [`Envelope`]: the 128-byte transport header and the
//!   `header | body | signature` envelope replicas exchange
//! - [`Transport`]: seal (checksum + Ed25519 sign) and verify
//!   (magic, cluster, sender, checksum, signature) for envelopes
//!
//! Layouts are pinned by hand-written little-endian serializers and
//! offset-asserting tests; equal logical content always serializes to
//! identical bytes.

mod envelope;
mod error;
mod header;
mod message;
mod transport;

pub use envelope::Envelope;
pub use error::WireError;
pub use header::{Command, Header, HEADER_SIZE};
pub use message::{ChatMessage, FLAG_DELETED, FLAG_EDITED, MESSAGE_SIZE};
pub use transport::{Transport, SIGNATURE_SIZE};
