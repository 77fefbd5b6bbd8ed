//! View-change message bodies.
//!
//! `Prepare` carries a raw chat message record and the other normal-case
//! commands ride entirely in the envelope header, so the only structured
//! body the protocol needs is [`LogSummary`]: the log state a replica
//! reports in `DoViewChange` and the merged state the new primary
//! installs via `StartView`.
//!
//! Body layout (little-endian):
//!
//! ```text
//! [last_op:u64][commit_num:u64][entry_count:u32][entries...]
//! entry = [op:u64][message:2368B]
//! ```
//!
//! The entries are the reporter's uncommitted suffix `(commit_num,
//! last_op]`, newest-biased and capped at [`MAX_VIEW_CHANGE_ENTRIES`] so
//! a summary always fits the 1 MiB envelope bound. The committed prefix
//! needs no transfer: a quorum already holds it durably.

use bytes::{BufMut, Bytes, BytesMut};
use driftchat_types::{CommitNumber, OpNumber};
use driftchat_wire::{ChatMessage, WireError, MESSAGE_SIZE};

/// Maximum log entries carried in a single view-change body.
pub const MAX_VIEW_CHANGE_ENTRIES: usize = 128;

const SUMMARY_HEADER_SIZE: usize = 8 + 8 + 4;
const SUMMARY_ENTRY_SIZE: usize = 8 + MESSAGE_SIZE;

// A full summary must fit one envelope.
const _: () = assert!(
    SUMMARY_HEADER_SIZE + MAX_VIEW_CHANGE_ENTRIES * SUMMARY_ENTRY_SIZE
        <= driftchat_types::MAX_ENVELOPE_BODY
);

/// One replica's reported log state, or the merged state being
/// installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub last_op: OpNumber,
    pub commit_num: CommitNumber,
    /// Uncommitted suffix entries in op order.
    pub suffix: Vec<(OpNumber, ChatMessage)>,
}

impl LogSummary {
    /// Builds a summary, keeping only the newest
    /// [`MAX_VIEW_CHANGE_ENTRIES`] suffix entries.
    pub fn new(
        last_op: OpNumber,
        commit_num: CommitNumber,
        mut suffix: Vec<(OpNumber, ChatMessage)>,
    ) -> Self {
        if suffix.len() > MAX_VIEW_CHANGE_ENTRIES {
            let drop = suffix.len() - MAX_VIEW_CHANGE_ENTRIES;
            tracing::warn!(
                dropped = drop,
                "view change suffix truncated to newest entries"
            );
            suffix.drain(..drop);
        }
        Self {
            last_op,
            commit_num,
            suffix,
        }
    }

    /// Serializes the summary into an envelope body.
    pub fn encode_body(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(SUMMARY_HEADER_SIZE + self.suffix.len() * SUMMARY_ENTRY_SIZE);
        buf.put_u64_le(self.last_op.as_u64());
        buf.put_u64_le(self.commit_num.as_u64());
        buf.put_u32_le(self.suffix.len() as u32);
        for (op, message) in &self.suffix {
            buf.put_u64_le(op.as_u64());
            buf.put_slice(&message.to_bytes());
        }
        buf.freeze()
    }

    /// Parses a summary from an envelope body.
    ///
    /// # Errors
    ///
    /// - [`WireError::Truncated`] on a short body
    /// - [`WireError::BodyTooLarge`] when the claimed entry count
    ///   exceeds [`MAX_VIEW_CHANGE_ENTRIES`] (a hostile peer padding
    ///   the transfer)
    pub fn decode_body(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < SUMMARY_HEADER_SIZE {
            return Err(WireError::Truncated {
                what: "log summary",
                need: SUMMARY_HEADER_SIZE,
                have: data.len(),
            });
        }

        let last_op = OpNumber::new(u64::from_le_bytes(
            data[0..8].try_into().expect("slice is 8 bytes"),
        ));
        let commit_num = CommitNumber::new(u64::from_le_bytes(
            data[8..16].try_into().expect("slice is 8 bytes"),
        ));
        let count = u32::from_le_bytes(data[16..20].try_into().expect("slice is 4 bytes")) as usize;

        if count > MAX_VIEW_CHANGE_ENTRIES {
            return Err(WireError::BodyTooLarge {
                len: SUMMARY_HEADER_SIZE + count * SUMMARY_ENTRY_SIZE,
            });
        }

        let need = SUMMARY_HEADER_SIZE + count * SUMMARY_ENTRY_SIZE;
        if data.len() < need {
            return Err(WireError::Truncated {
                what: "log summary entries",
                need,
                have: data.len(),
            });
        }

        let mut suffix = Vec::with_capacity(count);
        let mut pos = SUMMARY_HEADER_SIZE;
        for _ in 0..count {
            let op = OpNumber::new(u64::from_le_bytes(
                data[pos..pos + 8].try_into().expect("slice is 8 bytes"),
            ));
            let message = ChatMessage::from_bytes(&data[pos + 8..pos + SUMMARY_ENTRY_SIZE])?;
            suffix.push((op, message));
            pos += SUMMARY_ENTRY_SIZE;
        }

        Ok(Self {
            last_op,
            commit_num,
            suffix,
        })
    }
}
