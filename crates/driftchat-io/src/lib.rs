//! # driftchat-io: file I/O backend for the write-ahead log
//!
//! The [`IoBackend`] trait abstracts the handful of file operations the
//! WAL needs (open, append, positional read, fsync, truncate) so the
//! storage layer can be exercised against fault-injecting backends in
//! tests while production uses plain `std::fs` via [`SyncBackend`].

mod backend;
mod error;
mod sync_backend;

pub use backend::{FileHandle, IoBackend, OpenFlags};
pub use error::IoError;
pub use sync_backend::SyncBackend;
