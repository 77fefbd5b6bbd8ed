//! I/O backend error type.

use thiserror::Error;

/// Errors from the I/O backend.
#[derive(Debug, Error)]
pub enum IoError {
    /// Underlying operating system error.
    #[error("i/o error: {0}")]
    Os(#[from] std::io::Error),

    /// The file handle was already closed.
    #[error("invalid file handle {handle}")]
    InvalidHandle { handle: u64 },

    /// A write completed only partially.
    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}
