//! # driftchat-storage: the write-ahead log
//!
//! An append-only log of chat message records, one file per replica.
//! Every entry is checksummed twice (entry framing and the record's own
//! embedded checksum), every append is fsynced before it reports
//! success, and recovery validates the entire file or refuses to start.
//!
//! # Entry Format
//!
//! ```text
//! [op:u64][crc32c:u32][reserved:u32][message:2368B]
//!    8B        4B          4B          fixed
//! ```
//!
//! `crc32c` covers `op_le | message_bytes`. The file is a plain
//! concatenation of these fixed 2384-byte entries; a trailing fragment
//! means a torn write and is a fatal recovery error, never silently
//! repaired.

mod error;
mod wal;

pub use error::WalError;
pub use wal::{CompactionHook, Wal, ENTRY_HEADER_SIZE, ENTRY_SIZE};
