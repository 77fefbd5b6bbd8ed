//! The fixed-layout transport header.
//!
//! Every envelope starts with this 128-byte header:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "TIGR"
//!      4     1  version (1)
//!      5     1  command tag
//!      6     2  flags
//!      8     4  checksum: u32 = CRC32C(header[12..128] | body)
//!     12     4  body_len: u32
//!     16     8  nonce: u64 (sender-monotonic)
//!     24     8  timestamp_us: u64
//!     32    16  cluster_id: u128
//!     48     4  view: u32
//!     52     4  (padding, zero)
//!     56     8  op: u64
//!     64     8  commit_num: u64
//!     72     1  replica_id: u8
//!     73    55  reserved (zero)
//! ```
//!
//! The checksum field covers everything after itself and its own-size
//! prefix (bytes 12 onward), so it can be filled in last.

use driftchat_types::{ClusterId, CommitNumber, Nonce, OpNumber, ViewNumber};

use crate::WireError;

/// Serialized size of a transport header in bytes.
pub const HEADER_SIZE: usize = 128;

/// Header magic: ASCII "TIGR" at offset 0.
pub const MAGIC: [u8; 4] = *b"TIGR";

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_COMMAND: usize = 5;
const OFFSET_FLAGS: usize = 6;
const OFFSET_CHECKSUM: usize = 8;
const OFFSET_BODY_LEN: usize = 12;
const OFFSET_NONCE: usize = 16;
const OFFSET_TIMESTAMP: usize = 24;
const OFFSET_CLUSTER_ID: usize = 32;
const OFFSET_VIEW: usize = 48;
const OFFSET_OP: usize = 56;
const OFFSET_COMMIT: usize = 64;
const OFFSET_REPLICA_ID: usize = 72;

const _: () = assert!(HEADER_SIZE % 16 == 0);

/// Byte offset where the checksummed region of the header begins.
pub(crate) const CHECKSUM_COVERAGE_START: usize = OFFSET_BODY_LEN;

/// Command tags carried in the header.
///
/// Tags `0x01..=0x06` drive the replication protocol. Tags
/// `0x20..=0x24` belong to the edge gateway and its clients; the core
/// recognizes them only to forward their envelopes opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Prepare = 0x01,
    PrepareOk = 0x02,
    Commit = 0x03,
    StartViewChange = 0x04,
    DoViewChange = 0x05,
    StartView = 0x06,

    ClientSubmit = 0x20,
    ClientReply = 0x21,
    ClientSubscribe = 0x22,
    ClientEvent = 0x23,
    ClientPing = 0x24,
}

impl Command {
    /// Decodes a command tag.
    pub fn from_u8(tag: u8) -> Result<Self, WireError> {
        match tag {
            0x01 => Ok(Self::Prepare),
            0x02 => Ok(Self::PrepareOk),
            0x03 => Ok(Self::Commit),
            0x04 => Ok(Self::StartViewChange),
            0x05 => Ok(Self::DoViewChange),
            0x06 => Ok(Self::StartView),
            0x20 => Ok(Self::ClientSubmit),
            0x21 => Ok(Self::ClientReply),
            0x22 => Ok(Self::ClientSubscribe),
            0x23 => Ok(Self::ClientEvent),
            0x24 => Ok(Self::ClientPing),
            tag => Err(WireError::UnknownCommand { tag }),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the replication protocol tags handled by the core.
    pub fn is_core(self) -> bool {
        matches!(
            self,
            Self::Prepare
                | Self::PrepareOk
                | Self::Commit
                | Self::StartViewChange
                | Self::DoViewChange
                | Self::StartView
        )
    }

    /// True for the edge/client tags the core forwards without
    /// interpreting.
    pub fn is_edge(self) -> bool {
        !self.is_core()
    }
}

/// A decoded transport header.
///
/// `replica_id` is kept as the raw wire byte; the transport validates
/// the range during [`crate::Transport::verify`] so that an out-of-range
/// sender produces the right structured error rather than a decode
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub flags: u16,
    pub checksum: u32,
    pub body_len: u32,
    pub nonce: Nonce,
    pub timestamp_us: u64,
    pub cluster_id: ClusterId,
    pub view: ViewNumber,
    pub op: OpNumber,
    pub commit_num: CommitNumber,
    pub replica_id: u8,
}

impl Header {
    /// Serializes the header to its pinned 128-byte form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[OFFSET_MAGIC..OFFSET_MAGIC + 4].copy_from_slice(&MAGIC);
        buf[OFFSET_VERSION] = PROTOCOL_VERSION;
        buf[OFFSET_COMMAND] = self.command.as_u8();
        buf[OFFSET_FLAGS..OFFSET_FLAGS + 2].copy_from_slice(&self.flags.to_le_bytes());
        buf[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[OFFSET_BODY_LEN..OFFSET_BODY_LEN + 4].copy_from_slice(&self.body_len.to_le_bytes());
        buf[OFFSET_NONCE..OFFSET_NONCE + 8].copy_from_slice(&self.nonce.as_u64().to_le_bytes());
        buf[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8]
            .copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[OFFSET_CLUSTER_ID..OFFSET_CLUSTER_ID + 16]
            .copy_from_slice(&self.cluster_id.as_u128().to_le_bytes());
        buf[OFFSET_VIEW..OFFSET_VIEW + 4].copy_from_slice(&self.view.as_u32().to_le_bytes());
        // 52..56 stays zero (alignment hole)
        buf[OFFSET_OP..OFFSET_OP + 8].copy_from_slice(&self.op.as_u64().to_le_bytes());
        buf[OFFSET_COMMIT..OFFSET_COMMIT + 8]
            .copy_from_slice(&self.commit_num.as_u64().to_le_bytes());
        buf[OFFSET_REPLICA_ID] = self.replica_id;
        // 73..128 stays zero (reserved)
        buf
    }

    /// Deserializes a header, checking magic, version, and command tag.
    ///
    /// # Errors
    ///
    /// - [`WireError::Truncated`] if fewer than 128 bytes are available
    /// - [`WireError::InvalidMagicOrVersion`] on a foreign or stale frame
    /// - [`WireError::UnknownCommand`] on an unrecognized tag
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                what: "transport header",
                need: HEADER_SIZE,
                have: data.len(),
            });
        }

        if data[OFFSET_MAGIC..OFFSET_MAGIC + 4] != MAGIC || data[OFFSET_VERSION] != PROTOCOL_VERSION
        {
            return Err(WireError::InvalidMagicOrVersion);
        }

        let command = Command::from_u8(data[OFFSET_COMMAND])?;

        Ok(Self {
            command,
            flags: u16::from_le_bytes(
                data[OFFSET_FLAGS..OFFSET_FLAGS + 2]
                    .try_into()
                    .expect("slice is 2 bytes"),
            ),
            checksum: u32::from_le_bytes(
                data[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4]
                    .try_into()
                    .expect("slice is 4 bytes"),
            ),
            body_len: u32::from_le_bytes(
                data[OFFSET_BODY_LEN..OFFSET_BODY_LEN + 4]
                    .try_into()
                    .expect("slice is 4 bytes"),
            ),
            nonce: Nonce::new(u64::from_le_bytes(
                data[OFFSET_NONCE..OFFSET_NONCE + 8]
                    .try_into()
                    .expect("slice is 8 bytes"),
            )),
            timestamp_us: u64::from_le_bytes(
                data[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8]
                    .try_into()
                    .expect("slice is 8 bytes"),
            ),
            cluster_id: ClusterId::new(u128::from_le_bytes(
                data[OFFSET_CLUSTER_ID..OFFSET_CLUSTER_ID + 16]
                    .try_into()
                    .expect("slice is 16 bytes"),
            )),
            view: ViewNumber::new(u32::from_le_bytes(
                data[OFFSET_VIEW..OFFSET_VIEW + 4]
                    .try_into()
                    .expect("slice is 4 bytes"),
            )),
            op: OpNumber::new(u64::from_le_bytes(
                data[OFFSET_OP..OFFSET_OP + 8]
                    .try_into()
                    .expect("slice is 8 bytes"),
            )),
            commit_num: CommitNumber::new(u64::from_le_bytes(
                data[OFFSET_COMMIT..OFFSET_COMMIT + 8]
                    .try_into()
                    .expect("slice is 8 bytes"),
            )),
            replica_id: data[OFFSET_REPLICA_ID],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header() -> Header {
        Header {
            command: Command::Prepare,
            flags: 0,
            checksum: 0xDEAD_BEEF,
            body_len: 2368,
            nonce: Nonce::new(42),
            timestamp_us: 1_000_000,
            cluster_id: ClusterId::new(0xCAFE),
            view: ViewNumber::new(3),
            op: OpNumber::new(17),
            commit_num: CommitNumber::new(16),
            replica_id: 1,
        }
    }

    #[test]
    fn layout_offsets_pinned() {
        let bytes = test_header().to_bytes();

        assert_eq!(&bytes[0..4], b"TIGR");
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 0x01);
        assert_eq!(&bytes[8..12], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&bytes[12..16], &2368u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &42u64.to_le_bytes());
        assert_eq!(&bytes[32..48], &0xCAFEu128.to_le_bytes());
        assert_eq!(&bytes[48..52], &3u32.to_le_bytes());
        assert_eq!(&bytes[52..56], &[0u8; 4]);
        assert_eq!(&bytes[56..64], &17u64.to_le_bytes());
        assert_eq!(&bytes[64..72], &16u64.to_le_bytes());
        assert_eq!(bytes[72], 1);
        assert!(bytes[73..].iter().all(|&b| b == 0));
    }

    #[test]
    fn roundtrip_identity() {
        let header = test_header();
        let decoded = Header::from_bytes(&header.to_bytes()).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = test_header().to_bytes();
        bytes[0] = b'X';
        assert_eq!(
            Header::from_bytes(&bytes).unwrap_err(),
            WireError::InvalidMagicOrVersion
        );
    }

    #[test]
    fn bad_version_rejected() {
        let mut bytes = test_header().to_bytes();
        bytes[4] = 2;
        assert_eq!(
            Header::from_bytes(&bytes).unwrap_err(),
            WireError::InvalidMagicOrVersion
        );
    }

    #[test]
    fn unknown_command_rejected() {
        let mut bytes = test_header().to_bytes();
        bytes[5] = 0x7F;
        assert_eq!(
            Header::from_bytes(&bytes).unwrap_err(),
            WireError::UnknownCommand { tag: 0x7F }
        );
    }

    #[test]
    fn command_tags_pinned() {
        assert_eq!(Command::Prepare.as_u8(), 0x01);
        assert_eq!(Command::PrepareOk.as_u8(), 0x02);
        assert_eq!(Command::Commit.as_u8(), 0x03);
        assert_eq!(Command::StartViewChange.as_u8(), 0x04);
        assert_eq!(Command::DoViewChange.as_u8(), 0x05);
        assert_eq!(Command::StartView.as_u8(), 0x06);
        assert_eq!(Command::ClientSubmit.as_u8(), 0x20);
    }

    #[test]
    fn core_edge_split() {
        assert!(Command::Prepare.is_core());
        assert!(Command::StartView.is_core());
        assert!(Command::ClientSubmit.is_edge());
        assert!(Command::ClientPing.is_edge());
    }
}
