//! Write-ahead log error types.

use driftchat_io::IoError;
use thiserror::Error;

/// Errors from the write-ahead log.
///
/// Recovery errors (`CorruptLog`, `ChecksumMismatch`,
/// `MessageChecksumInvalid`, `NonMonotonicOp`) mean the replica refuses
/// to start; the operator restores the log from a peer.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] IoError),

    /// Short or malformed trailing record found during recovery. The
    /// log is never auto-truncated; this is a startup failure.
    #[error("corrupt log at byte offset {offset}")]
    CorruptLog { offset: u64 },

    /// An entry's framing checksum did not match its content.
    #[error("entry checksum mismatch at op {op}")]
    ChecksumMismatch { op: u64 },

    /// An entry framed correctly but the chat message's own embedded
    /// checksum is wrong.
    #[error("message checksum invalid at op {op}")]
    MessageChecksumInvalid { op: u64 },

    /// Entry op numbers must strictly increase through the file.
    #[error("non-monotonic op: {found} after {prev}")]
    NonMonotonicOp { prev: u64, found: u64 },

    /// The log holds `max_entries` entries; appends are refused until
    /// the operator compacts or reconfigures.
    #[error("log full at {max_entries} entries")]
    LogFull { max_entries: u64 },
}
