//! The write-ahead log.

use std::path::{Path, PathBuf};
use std::time::Instant;

use driftchat_crypto::Crc32c;
use driftchat_io::{FileHandle, IoBackend, OpenFlags, SyncBackend};
use driftchat_types::{OpNumber, MAX_WAL_ENTRIES};
use driftchat_wire::{ChatMessage, MESSAGE_SIZE};

use crate::WalError;

/// Size of the per-entry header: op (8) + checksum (4) + reserved (4).
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Total size of one log entry on disk.
pub const ENTRY_SIZE: usize = ENTRY_HEADER_SIZE + MESSAGE_SIZE;

/// Fraction of capacity (in tenths) at which the compaction hook fires.
const COMPACTION_THRESHOLD_TENTHS: u64 = 9;

/// Callback invoked once when the log crosses the compaction threshold.
pub type CompactionHook = Box<dyn FnMut(u64) + Send>;

/// An append-only, checksummed, fsync-on-append log of chat messages.
///
/// # Invariants
///
/// - Entry op numbers strictly increase through the file
/// - Every append is durable (fsynced) before `append` returns `Ok`
/// - `entry_count <= max_entries`
/// - The in-memory offset index always mirrors the file
pub struct Wal {
    backend: Box<dyn IoBackend>,
    handle: FileHandle,
    path: PathBuf,
    max_entries: u64,
    last_op: OpNumber,
    entry_count: u64,
    /// `(op, byte offset)` per entry, ascending in both components.
    offsets: Vec<(u64, u64)>,
    /// Duration of the most recent fsync, for the latency histogram.
    last_fsync_micros: u64,
    compaction_hook: Option<CompactionHook>,
    hook_fired: bool,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("max_entries", &self.max_entries)
            .field("last_op", &self.last_op)
            .field("entry_count", &self.entry_count)
            .finish_non_exhaustive()
    }
}

impl Wal {
    /// Opens (or creates) the log at `path` and recovers it.
    ///
    /// Recovery scans the whole file, validating both checksums and op
    /// monotonicity on every entry. Any violation is returned as an
    /// error and the log is left untouched; the operator restores from
    /// a peer.
    ///
    /// # Panics
    ///
    /// Panics if `max_entries` is outside `(0, 10_000_000]`; capacity is
    /// validated at configuration load, so an out-of-range value here is
    /// a caller bug.
    pub fn open(path: impl Into<PathBuf>, max_entries: u64) -> Result<Self, WalError> {
        Self::open_with_backend(path, max_entries, Box::new(SyncBackend::new()))
    }

    /// Opens the log with a caller-supplied I/O backend (tests).
    pub fn open_with_backend(
        path: impl Into<PathBuf>,
        max_entries: u64,
        backend: Box<dyn IoBackend>,
    ) -> Result<Self, WalError> {
        assert!(
            max_entries > 0 && max_entries <= MAX_WAL_ENTRIES,
            "wal capacity {max_entries} out of range"
        );

        let path = path.into();
        let handle = backend.open(&path, OpenFlags::append_create())?;

        let mut wal = Self {
            backend,
            handle,
            path,
            max_entries,
            last_op: OpNumber::ZERO,
            entry_count: 0,
            offsets: Vec::new(),
            last_fsync_micros: 0,
            compaction_hook: None,
            hook_fired: false,
        };
        wal.recover()?;
        Ok(wal)
    }

    /// Highest op in the log, zero if empty.
    pub fn last_op(&self) -> OpNumber {
        self.last_op
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Microseconds spent in the most recent fsync.
    pub fn last_fsync_micros(&self) -> u64 {
        self.last_fsync_micros
    }

    /// Registers the size-triggered compaction hook. The hook fires once
    /// when `entry_count` first reaches 90% of capacity; the core ships
    /// no compactor, the hook is the integration point for one.
    pub fn set_compaction_hook(&mut self, hook: CompactionHook) {
        self.compaction_hook = Some(hook);
    }

    /// Appends a sealed message at `op` and fsyncs before returning.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::LogFull`] at capacity. I/O failures surface
    /// as [`WalError::Io`]; the entry must then be considered torn and
    /// the process restarted through recovery.
    ///
    /// # Panics
    ///
    /// Panics if `op` does not exceed `last_op`: the replica assigns
    /// ops strictly monotonically, so a violation here is a protocol
    /// bug, not an input error.
    pub fn append(&mut self, op: OpNumber, message: &ChatMessage) -> Result<(), WalError> {
        assert!(
            op > self.last_op,
            "append op {op} not after last_op {last}",
            last = self.last_op
        );
        debug_assert!(message.verify_checksum(), "appending unsealed message");

        if self.entry_count >= self.max_entries {
            return Err(WalError::LogFull {
                max_entries: self.max_entries,
            });
        }

        let offset = self.entry_count * ENTRY_SIZE as u64;

        let mut entry = [0u8; ENTRY_SIZE];
        encode_entry(&mut entry, op, message);

        self.backend.write_all(&mut self.handle, &entry)?;

        let fsync_start = Instant::now();
        self.backend.fsync(&self.handle)?;
        self.last_fsync_micros = fsync_start.elapsed().as_micros() as u64;

        self.offsets.push((op.as_u64(), offset));
        self.last_op = op;
        self.entry_count += 1;

        if !self.hook_fired
            && self.entry_count * 10 >= self.max_entries * COMPACTION_THRESHOLD_TENTHS
        {
            self.hook_fired = true;
            if let Some(hook) = self.compaction_hook.as_mut() {
                hook(self.entry_count);
            }
        }

        Ok(())
    }

    /// Reads the message logged at `op`, verifying the entry checksum.
    ///
    /// Returns `Ok(None)` if no entry with that op exists.
    pub fn read(&self, op: OpNumber) -> Result<Option<ChatMessage>, WalError> {
        let Ok(index) = self.offsets.binary_search_by_key(&op.as_u64(), |&(o, _)| o) else {
            return Ok(None);
        };
        let (_, offset) = self.offsets[index];

        let mut entry = [0u8; ENTRY_SIZE];
        let read = self.backend.read_at(&self.handle, offset, &mut entry)?;
        if read != ENTRY_SIZE {
            return Err(WalError::CorruptLog { offset });
        }

        let message = decode_entry(&entry, offset)?;
        Ok(Some(message))
    }

    /// Reads every message in `(from, to]` in op order. Used to extract
    /// the uncommitted suffix for view-change transfer.
    pub fn read_range(
        &self,
        from_exclusive: OpNumber,
        to_inclusive: OpNumber,
    ) -> Result<Vec<(OpNumber, ChatMessage)>, WalError> {
        let mut out = Vec::new();
        for &(op, _) in &self.offsets {
            if op > from_exclusive.as_u64() && op <= to_inclusive.as_u64() {
                let op = OpNumber::new(op);
                if let Some(message) = self.read(op)? {
                    out.push((op, message));
                }
            }
        }
        Ok(out)
    }

    /// Discards every entry with op greater than `op`.
    ///
    /// This is the view-change installer's overwrite path, not a repair:
    /// a merged log state may supersede this replica's uncommitted
    /// suffix. The file is truncated and fsynced.
    pub fn truncate_to(&mut self, op: OpNumber) -> Result<(), WalError> {
        let keep = self
            .offsets
            .iter()
            .take_while(|&&(o, _)| o <= op.as_u64())
            .count();
        if keep == self.offsets.len() {
            return Ok(());
        }

        let new_len = keep as u64 * ENTRY_SIZE as u64;
        self.backend.truncate(&self.handle, new_len)?;
        self.backend.fsync(&self.handle)?;

        self.offsets.truncate(keep);
        self.entry_count = keep as u64;
        self.last_op = self
            .offsets
            .last()
            .map_or(OpNumber::ZERO, |&(o, _)| OpNumber::new(o));

        tracing::info!(
            last_op = %self.last_op,
            entries = self.entry_count,
            "truncated log for view change install"
        );
        Ok(())
    }

    /// Scans the file from byte 0, rebuilding the offset index.
    fn recover(&mut self) -> Result<(), WalError> {
        let data = self.backend.read_all(&self.path)?;

        let mut prev_op = 0u64;
        let mut pos = 0usize;

        while pos < data.len() {
            if data.len() - pos < ENTRY_SIZE {
                // Torn trailing entry: fatal, never auto-truncated.
                return Err(WalError::CorruptLog { offset: pos as u64 });
            }

            let entry: &[u8; ENTRY_SIZE] = data[pos..pos + ENTRY_SIZE]
                .try_into()
                .expect("slice is ENTRY_SIZE after bounds check");
            let op = u64::from_le_bytes(entry[0..8].try_into().expect("slice is 8 bytes"));

            let message = decode_entry(entry, pos as u64)?;
            if !message.verify_checksum() {
                return Err(WalError::MessageChecksumInvalid { op });
            }

            if op <= prev_op {
                return Err(WalError::NonMonotonicOp {
                    prev: prev_op,
                    found: op,
                });
            }

            self.entry_count += 1;
            if self.entry_count > self.max_entries {
                return Err(WalError::LogFull {
                    max_entries: self.max_entries,
                });
            }

            self.offsets.push((op, pos as u64));
            self.last_op = OpNumber::new(op);
            prev_op = op;
            pos += ENTRY_SIZE;
        }

        tracing::debug!(
            path = %self.path.display(),
            entries = self.entry_count,
            last_op = %self.last_op,
            "log recovered"
        );
        Ok(())
    }
}

/// Serializes one entry (header + message) into `buf`.
fn encode_entry(buf: &mut [u8; ENTRY_SIZE], op: OpNumber, message: &ChatMessage) {
    let message_bytes = message.to_bytes();

    buf[0..8].copy_from_slice(&op.as_u64().to_le_bytes());

    let mut hasher = Crc32c::new();
    hasher.update(&op.as_u64().to_le_bytes());
    hasher.update(&message_bytes);
    buf[8..12].copy_from_slice(&hasher.finalize().to_le_bytes());
    buf[12..16].fill(0); // reserved

    buf[ENTRY_HEADER_SIZE..].copy_from_slice(&message_bytes);
}

/// Parses and checksum-verifies one entry.
fn decode_entry(entry: &[u8; ENTRY_SIZE], offset: u64) -> Result<ChatMessage, WalError> {
    let op = u64::from_le_bytes(entry[0..8].try_into().expect("slice is 8 bytes"));
    let stored_crc = u32::from_le_bytes(entry[8..12].try_into().expect("slice is 4 bytes"));

    let mut hasher = Crc32c::new();
    hasher.update(&entry[0..8]);
    hasher.update(&entry[ENTRY_HEADER_SIZE..]);
    if hasher.finalize() != stored_crc {
        return Err(WalError::ChecksumMismatch { op });
    }

    ChatMessage::from_bytes(&entry[ENTRY_HEADER_SIZE..])
        .map_err(|_| WalError::CorruptLog { offset })
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftchat_types::{AuthorId, MsgId, RoomId};
    use std::fs;

    fn test_message(op: u64, body: &[u8]) -> ChatMessage {
        let mut msg = ChatMessage::new(
            RoomId::new(1),
            MsgId::from_parts(op * 1_000, OpNumber::new(op)),
            AuthorId::new(1),
            MsgId::NONE,
            op * 1_000,
            op,
            0,
            body,
        )
        .expect("body fits");
        msg.seal();
        msg
    }

    fn wal_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("replica.wal")
    }

    #[test]
    fn append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(wal_path(&dir), 100).unwrap();

        let msg = test_message(1, b"hello");
        wal.append(OpNumber::new(1), &msg).unwrap();

        assert_eq!(wal.last_op(), OpNumber::new(1));
        assert_eq!(wal.entry_count(), 1);

        let read = wal.read(OpNumber::new(1)).unwrap().expect("present");
        assert_eq!(read, msg);
        assert!(wal.read(OpNumber::new(2)).unwrap().is_none());
    }

    #[test]
    fn reopen_recovers_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        {
            let mut wal = Wal::open(&path, 100).unwrap();
            for op in 1..=5u64 {
                wal.append(OpNumber::new(op), &test_message(op, b"msg")).unwrap();
            }
        }

        let wal = Wal::open(&path, 100).unwrap();
        assert_eq!(wal.last_op(), OpNumber::new(5));
        assert_eq!(wal.entry_count(), 5);
        for op in 1..=5u64 {
            assert!(wal.read(OpNumber::new(op)).unwrap().is_some());
        }
    }

    // Scenario: two valid entries then a truncated trailing header.
    // Recovery refuses to start; the file is never repaired.
    #[test]
    fn trailing_truncation_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        {
            let mut wal = Wal::open(&path, 100).unwrap();
            wal.append(OpNumber::new(1), &test_message(1, b"one")).unwrap();
            wal.append(OpNumber::new(2), &test_message(2, b"two")).unwrap();
        }

        // Append a torn fragment of a third entry.
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&3u64.to_le_bytes());
        fs::write(&path, &data).unwrap();

        let err = Wal::open(&path, 100).unwrap_err();
        assert!(matches!(err, WalError::CorruptLog { offset } if offset == 2 * ENTRY_SIZE as u64));

        // The file was not modified by the failed recovery.
        assert_eq!(fs::read(&path).unwrap().len(), 2 * ENTRY_SIZE + 8);
    }

    #[test]
    fn flipped_entry_byte_fails_entry_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        {
            let mut wal = Wal::open(&path, 100).unwrap();
            wal.append(OpNumber::new(1), &test_message(1, b"x")).unwrap();
        }

        let mut data = fs::read(&path).unwrap();
        data[ENTRY_HEADER_SIZE + 100] ^= 0x01; // inside the message region
        fs::write(&path, &data).unwrap();

        let err = Wal::open(&path, 100).unwrap_err();
        assert!(matches!(err, WalError::ChecksumMismatch { op: 1 }));
    }

    #[test]
    fn valid_entry_with_bad_embedded_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        // Craft an entry whose framing checksum is correct but whose
        // message carries a wrong embedded checksum.
        let mut msg = test_message(1, b"x");
        msg.checksum ^= 0xFFFF_FFFF;

        let mut entry = [0u8; ENTRY_SIZE];
        encode_entry(&mut entry, OpNumber::new(1), &msg);
        fs::write(&path, entry).unwrap();

        let err = Wal::open(&path, 100).unwrap_err();
        assert!(matches!(err, WalError::MessageChecksumInvalid { op: 1 }));
    }

    #[test]
    fn non_monotonic_op_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        let mut file = Vec::new();
        for op in [2u64, 2u64] {
            let mut entry = [0u8; ENTRY_SIZE];
            encode_entry(&mut entry, OpNumber::new(op), &test_message(op, b"m"));
            file.extend_from_slice(&entry);
        }
        fs::write(&path, &file).unwrap();

        let err = Wal::open(&path, 100).unwrap_err();
        assert!(matches!(err, WalError::NonMonotonicOp { prev: 2, found: 2 }));
    }

    #[test]
    fn log_full_refuses_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(wal_path(&dir), 2).unwrap();

        wal.append(OpNumber::new(1), &test_message(1, b"a")).unwrap();
        wal.append(OpNumber::new(2), &test_message(2, b"b")).unwrap();

        let err = wal.append(OpNumber::new(3), &test_message(3, b"c")).unwrap_err();
        assert!(matches!(err, WalError::LogFull { max_entries: 2 }));
        assert_eq!(wal.entry_count(), 2);
    }

    #[test]
    #[should_panic(expected = "not after last_op")]
    fn non_monotonic_append_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(wal_path(&dir), 100).unwrap();

        wal.append(OpNumber::new(1), &test_message(1, b"a")).unwrap();
        let _ = wal.append(OpNumber::new(1), &test_message(1, b"dup"));
    }

    #[test]
    fn truncate_discards_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);
        let mut wal = Wal::open(&path, 100).unwrap();

        for op in 1..=5u64 {
            wal.append(OpNumber::new(op), &test_message(op, b"m")).unwrap();
        }

        wal.truncate_to(OpNumber::new(3)).unwrap();
        assert_eq!(wal.last_op(), OpNumber::new(3));
        assert_eq!(wal.entry_count(), 3);
        assert!(wal.read(OpNumber::new(4)).unwrap().is_none());

        // Survives reopen.
        drop(wal);
        let wal = Wal::open(&path, 100).unwrap();
        assert_eq!(wal.last_op(), OpNumber::new(3));
    }

    #[test]
    fn read_range_returns_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(wal_path(&dir), 100).unwrap();

        for op in 1..=5u64 {
            wal.append(OpNumber::new(op), &test_message(op, b"m")).unwrap();
        }

        let suffix = wal
            .read_range(OpNumber::new(2), OpNumber::new(4))
            .unwrap();
        let ops: Vec<u64> = suffix.iter().map(|(op, _)| op.as_u64()).collect();
        assert_eq!(ops, vec![3, 4]);
    }

    #[test]
    fn compaction_hook_fires_once_at_threshold() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(wal_path(&dir), 10).unwrap();

        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        wal.set_compaction_hook(Box::new(move |count| {
            fired_clone.store(count, Ordering::SeqCst);
        }));

        for op in 1..=8u64 {
            wal.append(OpNumber::new(op), &test_message(op, b"m")).unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        wal.append(OpNumber::new(9), &test_message(9, b"m")).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 9);

        wal.append(OpNumber::new(10), &test_message(10, b"m")).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 9, "hook fires only once");
    }

    #[test]
    fn empty_log_recovers_clean() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(wal_path(&dir), 100).unwrap();
        assert_eq!(wal.last_op(), OpNumber::ZERO);
        assert_eq!(wal.entry_count(), 0);
    }
}
