//! I/O backend trait.
//!
//! The [`IoBackend`] trait abstracts file I/O so that:
//! - production uses standard `std::fs` I/O ([`crate::SyncBackend`])
//! - tests can substitute fault-injecting or in-memory backends
//!
//! All methods are synchronous; the WAL's durability contract (fsync
//! before append returns) is expressed directly through [`IoBackend::fsync`].

use std::path::Path;

use bytes::Bytes;

use crate::IoError;

/// Flags for opening files.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Create the file if it doesn't exist.
    pub create: bool,
    /// Open in append mode.
    pub append: bool,
}

impl OpenFlags {
    /// Flags for reading an existing file.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Flags for creating or appending to a log file.
    pub fn append_create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            append: true,
        }
    }
}

/// Opaque handle to an open file.
///
/// Backend-specific; for [`crate::SyncBackend`] it wraps a
/// `std::fs::File`. Close via [`IoBackend::close`].
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) id: u64,
    pub(crate) file: Option<std::fs::File>,
}

impl FileHandle {
    pub(crate) fn from_file(id: u64, file: std::fs::File) -> Self {
        Self {
            id,
            file: Some(file),
        }
    }

    pub(crate) fn file(&self) -> Result<&std::fs::File, IoError> {
        self.file
            .as_ref()
            .ok_or(IoError::InvalidHandle { handle: self.id })
    }

    pub(crate) fn file_mut(&mut self) -> Result<&mut std::fs::File, IoError> {
        self.file
            .as_mut()
            .ok_or(IoError::InvalidHandle { handle: self.id })
    }
}

/// Abstraction over the file operations the write-ahead log performs.
pub trait IoBackend: Send + Sync {
    /// Opens a file with the given flags.
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, IoError>;

    /// Reads from the file at the given byte offset.
    ///
    /// Returns the number of bytes read (may be short at EOF).
    fn read_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Writes the whole buffer at the current position (end, in append
    /// mode).
    ///
    /// # Errors
    ///
    /// Returns [`IoError::ShortWrite`] if the OS accepted fewer bytes
    /// than requested.
    fn write_all(&self, handle: &mut FileHandle, buf: &[u8]) -> Result<(), IoError>;

    /// Syncs file data and metadata to stable storage.
    fn fsync(&self, handle: &FileHandle) -> Result<(), IoError>;

    /// Truncates the file to `len` bytes.
    ///
    /// Used only by the view-change installer to discard an uncommitted
    /// log suffix; recovery never truncates.
    fn truncate(&self, handle: &FileHandle, len: u64) -> Result<(), IoError>;

    /// Closes a file handle.
    fn close(&self, handle: FileHandle) -> Result<(), IoError>;

    /// Reads an entire file into memory (recovery scan).
    fn read_all(&self, path: &Path) -> Result<Bytes, IoError>;

    /// Returns the file size in bytes.
    fn file_size(&self, handle: &FileHandle) -> Result<u64, IoError>;
}
