//! Wire protocol error types.

use thiserror::Error;

/// Errors produced while encoding, decoding, or verifying wire data.
///
/// Every variant is an expected failure: hostile or corrupted input is
/// rejected with one of these, and no state is mutated on the rejection
/// path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Header magic or protocol version did not match.
    #[error("invalid magic or version")]
    InvalidMagicOrVersion,

    /// Unrecognized command tag.
    #[error("unknown command tag {tag:#04x}")]
    UnknownCommand { tag: u8 },

    /// Envelope was attributed to a cluster other than ours.
    #[error("cluster id mismatch")]
    ClusterIdMismatch,

    /// Sender id outside the replica range `{0, 1, 2}`.
    #[error("invalid sender id {sender}")]
    InvalidSenderId { sender: u8 },

    /// CRC-32C over header tail and body did not match the header field.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Ed25519 signature did not verify against the sender's key.
    #[error("invalid signature")]
    InvalidSignature,

    /// Envelope nonce did not exceed the last accepted nonce from that
    /// sender.
    #[error("replayed nonce {nonce} from replica {sender}")]
    ReplayedNonce { sender: u8, nonce: u64 },

    /// Body exceeds the 1 MiB envelope bound.
    #[error("body of {len} bytes exceeds maximum envelope body")]
    BodyTooLarge { len: usize },

    /// Chat message body length field exceeds the 2048-byte bound.
    #[error("message body length {len} exceeds maximum")]
    MessageBodyTooLarge { len: u32 },

    /// Buffer too short for the fixed layout being decoded.
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
}
