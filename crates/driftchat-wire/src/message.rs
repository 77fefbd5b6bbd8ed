//! The fixed-layout chat message record.
//!
//! One record is 2368 bytes and appears in three places with identical
//! bytes: the write-ahead log (after a 16-byte entry header), `Prepare`
//! envelope bodies, and the uncommitted-suffix transfer during view
//! change. The layout is the natural 16-byte-aligned extern layout,
//! serialized by hand so that it is pinned independently of the
//! compiler:
//!
//! ```text
//! offset  size  field
//!      0    16  room_id: u128
//!     16    16  msg_id: u128
//!     32     8  author_id: u64
//!     40     8  (padding, zero)
//!     48    16  parent_id: u128
//!     64     8  timestamp_us: u64
//!     72     8  client_sequence: u64
//!     80     4  body_len: u32
//!     84     4  flags: u32
//!     88  2048  body (zero past body_len)
//!   2136    32  prev_hash
//!   2168     4  checksum: u32 = CRC32C(bytes 0..2168)
//!   2172   196  reserved (zero)
//! ```
//!
//! The checksum covers every semantic field including `prev_hash`;
//! padding is zeroed before it is computed so that equal logical content
//! produces equal bytes on every replica.

use driftchat_crypto::{crc32c, sha256};
use driftchat_types::{AuthorId, Hash, MsgId, RoomId, MAX_BODY_LEN};

use crate::WireError;

/// Serialized size of a chat message record in bytes.
pub const MESSAGE_SIZE: usize = 2368;

/// Flag bit: message has been deleted (body retained for the chain).
pub const FLAG_DELETED: u32 = 1 << 0;

/// Flag bit: message is an edit of an earlier message.
pub const FLAG_EDITED: u32 = 1 << 1;

// Field offsets within the serialized record.
const OFFSET_ROOM_ID: usize = 0;
const OFFSET_MSG_ID: usize = 16;
const OFFSET_AUTHOR_ID: usize = 32;
const OFFSET_PARENT_ID: usize = 48;
const OFFSET_TIMESTAMP: usize = 64;
const OFFSET_CLIENT_SEQUENCE: usize = 72;
const OFFSET_BODY_LEN: usize = 80;
const OFFSET_FLAGS: usize = 84;
const OFFSET_BODY: usize = 88;
const OFFSET_PREV_HASH: usize = 2136;
const OFFSET_CHECKSUM: usize = 2168;
const OFFSET_RESERVED: usize = 2172;

const _: () = assert!(OFFSET_BODY + MAX_BODY_LEN == OFFSET_PREV_HASH);
const _: () = assert!(OFFSET_RESERVED + 196 == MESSAGE_SIZE);
const _: () = assert!(MESSAGE_SIZE % 16 == 0);

/// A chat message record with pinned serialized form.
///
/// `body` always holds the full 2048-byte region; bytes past `body_len`
/// are kept zero by [`ChatMessage::seal`] so the serialized form is
/// canonical.
#[derive(Clone)]
pub struct ChatMessage {
    pub room_id: RoomId,
    pub msg_id: MsgId,
    pub author_id: AuthorId,
    pub parent_id: MsgId,
    pub timestamp_us: u64,
    pub client_sequence: u64,
    pub body_len: u32,
    pub flags: u32,
    pub body: [u8; MAX_BODY_LEN],
    pub prev_hash: Hash,
    pub checksum: u32,
}

impl ChatMessage {
    /// Creates an unsealed record from its logical content.
    ///
    /// The caller sets `prev_hash` (the room's chain head) and then calls
    /// [`ChatMessage::seal`] before the record leaves this process.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::MessageBodyTooLarge`] if `body` exceeds 2048
    /// bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        room_id: RoomId,
        msg_id: MsgId,
        author_id: AuthorId,
        parent_id: MsgId,
        timestamp_us: u64,
        client_sequence: u64,
        flags: u32,
        body: &[u8],
    ) -> Result<Self, WireError> {
        if body.len() > MAX_BODY_LEN {
            return Err(WireError::MessageBodyTooLarge {
                len: body.len() as u32,
            });
        }

        let mut buf = [0u8; MAX_BODY_LEN];
        buf[..body.len()].copy_from_slice(body);

        Ok(Self {
            room_id,
            msg_id,
            author_id,
            parent_id,
            timestamp_us,
            client_sequence,
            body_len: body.len() as u32,
            flags,
            body: buf,
            prev_hash: Hash::GENESIS,
            checksum: 0,
        })
    }

    /// Returns the meaningful prefix of the body.
    pub fn body(&self) -> &[u8] {
        &self.body[..self.body_len as usize]
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_edited(&self) -> bool {
        self.flags & FLAG_EDITED != 0
    }

    /// Zeroes the body tail past `body_len`.
    ///
    /// Must run before checksum computation: the checksum covers the
    /// full body region, and sender and receiver must agree byte for
    /// byte on records with equal logical content.
    pub fn zero_padding(&mut self) {
        let len = (self.body_len as usize).min(MAX_BODY_LEN);
        self.body[len..].fill(0);
    }

    /// Computes the record checksum: CRC-32C over every byte preceding
    /// the checksum field in the serialized form.
    pub fn calculate_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32c(&bytes[..OFFSET_CHECKSUM])
    }

    /// Zeroes padding and stores the checksum. After sealing, the record
    /// round-trips byte-identically.
    pub fn seal(&mut self) {
        self.zero_padding();
        self.checksum = self.calculate_checksum();
    }

    /// Verifies the embedded checksum against the record's content.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// SHA-256 over the full serialized record; this is the value the
    /// next message in the room stores as `prev_hash`.
    pub fn calculate_hash(&self) -> Hash {
        Hash::from_bytes(sha256(&self.to_bytes()))
    }

    /// Serializes the record to its pinned 2368-byte form.
    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        self.write_into(&mut buf);
        buf
    }

    /// Serializes into a caller-provided buffer.
    pub fn write_into(&self, buf: &mut [u8; MESSAGE_SIZE]) {
        buf.fill(0);
        buf[OFFSET_ROOM_ID..OFFSET_ROOM_ID + 16]
            .copy_from_slice(&self.room_id.as_u128().to_le_bytes());
        buf[OFFSET_MSG_ID..OFFSET_MSG_ID + 16].copy_from_slice(&self.msg_id.as_u128().to_le_bytes());
        buf[OFFSET_AUTHOR_ID..OFFSET_AUTHOR_ID + 8]
            .copy_from_slice(&self.author_id.as_u64().to_le_bytes());
        // 40..48 stays zero (alignment hole)
        buf[OFFSET_PARENT_ID..OFFSET_PARENT_ID + 16]
            .copy_from_slice(&self.parent_id.as_u128().to_le_bytes());
        buf[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8]
            .copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[OFFSET_CLIENT_SEQUENCE..OFFSET_CLIENT_SEQUENCE + 8]
            .copy_from_slice(&self.client_sequence.to_le_bytes());
        buf[OFFSET_BODY_LEN..OFFSET_BODY_LEN + 4].copy_from_slice(&self.body_len.to_le_bytes());
        buf[OFFSET_FLAGS..OFFSET_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        buf[OFFSET_BODY..OFFSET_BODY + MAX_BODY_LEN].copy_from_slice(&self.body);
        buf[OFFSET_PREV_HASH..OFFSET_PREV_HASH + 32].copy_from_slice(self.prev_hash.as_bytes());
        buf[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4].copy_from_slice(&self.checksum.to_le_bytes());
        // 2172..2368 stays zero (reserved)
    }

    /// Deserializes a record from its pinned form.
    ///
    /// Validates the body length bound but not the checksum; callers
    /// decide when verification happens (WAL recovery verifies every
    /// record, the transport layer has already checksummed the envelope).
    ///
    /// # Errors
    ///
    /// - [`WireError::Truncated`] if `data` is shorter than 2368 bytes
    /// - [`WireError::MessageBodyTooLarge`] if `body_len` exceeds 2048
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < MESSAGE_SIZE {
            return Err(WireError::Truncated {
                what: "chat message",
                need: MESSAGE_SIZE,
                have: data.len(),
            });
        }

        let body_len = u32::from_le_bytes(
            data[OFFSET_BODY_LEN..OFFSET_BODY_LEN + 4]
                .try_into()
                .expect("slice is 4 bytes"),
        );
        if body_len as usize > MAX_BODY_LEN {
            return Err(WireError::MessageBodyTooLarge { len: body_len });
        }

        let mut body = [0u8; MAX_BODY_LEN];
        body.copy_from_slice(&data[OFFSET_BODY..OFFSET_BODY + MAX_BODY_LEN]);

        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(&data[OFFSET_PREV_HASH..OFFSET_PREV_HASH + 32]);

        Ok(Self {
            room_id: RoomId::new(u128::from_le_bytes(
                data[OFFSET_ROOM_ID..OFFSET_ROOM_ID + 16]
                    .try_into()
                    .expect("slice is 16 bytes"),
            )),
            msg_id: MsgId::new(u128::from_le_bytes(
                data[OFFSET_MSG_ID..OFFSET_MSG_ID + 16]
                    .try_into()
                    .expect("slice is 16 bytes"),
            )),
            author_id: AuthorId::new(u64::from_le_bytes(
                data[OFFSET_AUTHOR_ID..OFFSET_AUTHOR_ID + 8]
                    .try_into()
                    .expect("slice is 8 bytes"),
            )),
            parent_id: MsgId::new(u128::from_le_bytes(
                data[OFFSET_PARENT_ID..OFFSET_PARENT_ID + 16]
                    .try_into()
                    .expect("slice is 16 bytes"),
            )),
            timestamp_us: u64::from_le_bytes(
                data[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8]
                    .try_into()
                    .expect("slice is 8 bytes"),
            ),
            client_sequence: u64::from_le_bytes(
                data[OFFSET_CLIENT_SEQUENCE..OFFSET_CLIENT_SEQUENCE + 8]
                    .try_into()
                    .expect("slice is 8 bytes"),
            ),
            body_len,
            flags: u32::from_le_bytes(
                data[OFFSET_FLAGS..OFFSET_FLAGS + 4]
                    .try_into()
                    .expect("slice is 4 bytes"),
            ),
            body,
            prev_hash: Hash::from_bytes(prev_hash),
            checksum: u32::from_le_bytes(
                data[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4]
                    .try_into()
                    .expect("slice is 4 bytes"),
            ),
        })
    }
}

impl PartialEq for ChatMessage {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for ChatMessage {}

impl std::fmt::Debug for ChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatMessage")
            .field("room_id", &self.room_id)
            .field("msg_id", &self.msg_id)
            .field("author_id", &self.author_id)
            .field("parent_id", &self.parent_id)
            .field("timestamp_us", &self.timestamp_us)
            .field("client_sequence", &self.client_sequence)
            .field("body_len", &self.body_len)
            .field("flags", &self.flags)
            .field("prev_hash", &self.prev_hash)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftchat_types::OpNumber;

    fn test_message(body: &[u8]) -> ChatMessage {
        let mut msg = ChatMessage::new(
            RoomId::new(1),
            MsgId::from_parts(1_000, OpNumber::new(1)),
            AuthorId::new(7),
            MsgId::NONE,
            1_000,
            1,
            0,
            body,
        )
        .expect("body fits");
        msg.seal();
        msg
    }

    #[test]
    fn layout_offsets_pinned() {
        let msg = test_message(b"hello");
        let bytes = msg.to_bytes();

        assert_eq!(&bytes[0..16], &1u128.to_le_bytes());
        assert_eq!(&bytes[32..40], &7u64.to_le_bytes());
        // Alignment hole is zero
        assert_eq!(&bytes[40..48], &[0u8; 8]);
        assert_eq!(&bytes[64..72], &1_000u64.to_le_bytes());
        assert_eq!(&bytes[80..84], &5u32.to_le_bytes());
        assert_eq!(&bytes[88..93], b"hello");
        assert_eq!(
            &bytes[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4],
            &msg.checksum.to_le_bytes()
        );
        // Reserved tail is zero
        assert!(bytes[OFFSET_RESERVED..].iter().all(|&b| b == 0));
    }

    #[test]
    fn roundtrip_identity() {
        let msg = test_message(b"the quick brown fox");
        let decoded = ChatMessage::from_bytes(&msg.to_bytes()).expect("decode");
        assert_eq!(decoded, msg);
        assert!(decoded.verify_checksum());
    }

    #[test]
    fn equal_content_equal_bytes() {
        // Same logical content built twice, one with garbage in the
        // padding region before sealing.
        let a = test_message(b"hi");
        let mut b = ChatMessage::new(
            RoomId::new(1),
            MsgId::from_parts(1_000, OpNumber::new(1)),
            AuthorId::new(7),
            MsgId::NONE,
            1_000,
            1,
            0,
            b"hi",
        )
        .expect("body fits");
        b.body[100] = 0xFF;
        b.seal();

        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn checksum_covers_prev_hash() {
        let mut msg = test_message(b"chained");
        let original = msg.checksum;
        msg.prev_hash = Hash::from_bytes([0xAA; 32]);
        assert_ne!(msg.calculate_checksum(), original);
        assert!(!msg.verify_checksum());
    }

    #[test]
    fn tampered_body_fails_checksum() {
        let mut msg = test_message(b"payload");
        msg.body[0] ^= 0x01;
        assert!(!msg.verify_checksum());
    }

    #[test]
    fn body_too_large_rejected() {
        let big = vec![b'x'; MAX_BODY_LEN + 1];
        let err = ChatMessage::new(
            RoomId::new(1),
            MsgId::NONE,
            AuthorId::new(1),
            MsgId::NONE,
            0,
            1,
            0,
            &big,
        )
        .unwrap_err();
        assert!(matches!(err, WireError::MessageBodyTooLarge { .. }));
    }

    #[test]
    fn decode_rejects_oversized_body_len() {
        let msg = test_message(b"ok");
        let mut bytes = msg.to_bytes();
        bytes[OFFSET_BODY_LEN..OFFSET_BODY_LEN + 4]
            .copy_from_slice(&(MAX_BODY_LEN as u32 + 1).to_le_bytes());
        let err = ChatMessage::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, WireError::MessageBodyTooLarge { .. }));
    }

    #[test]
    fn decode_rejects_truncation() {
        let msg = test_message(b"ok");
        let bytes = msg.to_bytes();
        let err = ChatMessage::from_bytes(&bytes[..MESSAGE_SIZE - 1]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn flags_helpers() {
        let mut msg = test_message(b"x");
        assert!(!msg.is_deleted());
        msg.flags |= FLAG_DELETED;
        assert!(msg.is_deleted());
        msg.flags |= FLAG_EDITED;
        assert!(msg.is_edited());
    }

    #[test]
    fn hash_is_deterministic_over_serialized_form() {
        let a = test_message(b"same");
        let b = test_message(b"same");
        assert_eq!(a.calculate_hash(), b.calculate_hash());
        assert_ne!(
            a.calculate_hash(),
            test_message(b"different").calculate_hash()
        );
    }

    #[test]
    fn proptest_roundtrip_arbitrary_content() {
        use proptest::prelude::*;

        proptest!(|(
            room in any::<u128>(),
            author in any::<u64>(),
            seq in any::<u64>(),
            ts in any::<u64>(),
            flags in 0u32..4,
            body in proptest::collection::vec(any::<u8>(), 0..512)
        )| {
            let mut msg = ChatMessage::new(
                RoomId::new(room),
                MsgId::from_parts(ts, OpNumber::new(seq)),
                AuthorId::new(author),
                MsgId::NONE,
                ts,
                seq,
                flags,
                &body,
            )
            .expect("bounded body fits");
            msg.seal();

            let decoded = ChatMessage::from_bytes(&msg.to_bytes()).expect("decode");
            prop_assert!(decoded.verify_checksum());
            prop_assert_eq!(&decoded, &msg);
            prop_assert_eq!(decoded.body(), &body[..]);
        });
    }
}
