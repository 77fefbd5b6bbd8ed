//! Synchronous I/O backend using `std::fs`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::backend::{FileHandle, IoBackend, OpenFlags};
use crate::IoError;

/// Default backend over `std::fs::File`. All operations block.
#[derive(Debug)]
pub struct SyncBackend {
    /// Counter for generating unique file handle IDs.
    next_handle_id: AtomicU64,
}

impl SyncBackend {
    pub fn new() -> Self {
        Self {
            next_handle_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_handle_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SyncBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBackend for SyncBackend {
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, IoError> {
        let mut opts = OpenOptions::new();

        if flags.read {
            opts.read(true);
        }
        if flags.write {
            opts.write(true);
        }
        if flags.create {
            opts.create(true);
        }
        if flags.append {
            opts.append(true);
        }

        let file = opts.open(path)?;
        Ok(FileHandle::from_file(self.next_id(), file))
    }

    fn read_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let n = handle.file()?.read_at(buf, offset)?;
            Ok(n)
        }

        #[cfg(not(unix))]
        {
            use std::os::windows::fs::FileExt;
            let n = handle.file()?.seek_read(buf, offset)?;
            Ok(n)
        }
    }

    fn write_all(&self, handle: &mut FileHandle, buf: &[u8]) -> Result<(), IoError> {
        let file = handle.file_mut()?;
        let written = file.write(buf)?;
        if written != buf.len() {
            // One retryable continuation, then give up; append-mode
            // writes to a regular file rarely split.
            let more = file.write(&buf[written..])?;
            if written + more != buf.len() {
                return Err(IoError::ShortWrite {
                    written: written + more,
                    expected: buf.len(),
                });
            }
        }
        Ok(())
    }

    fn fsync(&self, handle: &FileHandle) -> Result<(), IoError> {
        handle.file()?.sync_all()?;
        Ok(())
    }

    fn truncate(&self, handle: &FileHandle, len: u64) -> Result<(), IoError> {
        handle.file()?.set_len(len)?;
        Ok(())
    }

    fn close(&self, mut handle: FileHandle) -> Result<(), IoError> {
        // Drop the file to close it
        handle.file = None;
        Ok(())
    }

    fn read_all(&self, path: &Path) -> Result<Bytes, IoError> {
        let data = fs::read(path)?;
        Ok(Bytes::from(data))
    }

    fn file_size(&self, handle: &FileHandle) -> Result<u64, IoError> {
        Ok(handle.file()?.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_fsync_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");
        let backend = SyncBackend::new();

        let mut handle = backend.open(&path, OpenFlags::append_create()).unwrap();
        backend.write_all(&mut handle, b"hello world").unwrap();
        backend.fsync(&handle).unwrap();
        backend.close(handle).unwrap();

        let data = backend.read_all(&path).unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[test]
    fn read_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.dat");
        let backend = SyncBackend::new();

        let mut handle = backend.open(&path, OpenFlags::append_create()).unwrap();
        backend.write_all(&mut handle, b"0123456789").unwrap();

        let mut buf = [0u8; 5];
        let n = backend.read_at(&handle, 3, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"34567");
        backend.close(handle).unwrap();
    }

    #[test]
    fn append_mode_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.dat");
        let backend = SyncBackend::new();

        let mut handle = backend.open(&path, OpenFlags::append_create()).unwrap();
        backend.write_all(&mut handle, b"first").unwrap();
        backend.close(handle).unwrap();

        let mut handle = backend.open(&path, OpenFlags::append_create()).unwrap();
        backend.write_all(&mut handle, b" second").unwrap();
        backend.close(handle).unwrap();

        assert_eq!(&backend.read_all(&path).unwrap()[..], b"first second");
    }

    #[test]
    fn truncate_discards_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.dat");
        let backend = SyncBackend::new();

        let mut handle = backend.open(&path, OpenFlags::append_create()).unwrap();
        backend.write_all(&mut handle, b"keep-drop").unwrap();
        backend.truncate(&handle, 4).unwrap();
        assert_eq!(backend.file_size(&handle).unwrap(), 4);
        backend.close(handle).unwrap();

        assert_eq!(&backend.read_all(&path).unwrap()[..], b"keep");
    }

    #[test]
    fn closed_handle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.dat");
        let backend = SyncBackend::new();

        let mut handle = backend.open(&path, OpenFlags::append_create()).unwrap();
        handle.file = None;
        assert!(matches!(
            backend.write_all(&mut handle, b"x").unwrap_err(),
            IoError::InvalidHandle { .. }
        ));
    }
}
