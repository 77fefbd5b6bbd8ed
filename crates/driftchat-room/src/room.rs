//! Room state and the apply operation.

use std::collections::HashMap;

use driftchat_types::{
    AuthorId, Hash, MsgId, OpNumber, RoomId, MAX_IDEMPOTENCY_ENTRIES, MAX_MESSAGES_PER_ROOM,
};
use driftchat_wire::ChatMessage;

use crate::RoomError;

/// Result of applying an operation to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyResult {
    /// False when the operation was a duplicate of an earlier
    /// submission with the same `(author_id, client_sequence)`.
    pub applied: bool,
    /// The op that carries this logical message: the new op when
    /// applied, the original op when deduplicated.
    pub op: OpNumber,
}

/// One room's applied state.
///
/// # Invariants
///
/// - `messages.len() == message_count` and equals the room's op count
/// - `head_hash` is the SHA-256 of the most recently applied record
///   (`GENESIS` when empty)
/// - every `(author_id, client_sequence)` pair maps to at most one op
/// - `timestamp_us` never decreases along the message sequence
#[derive(Debug, Clone)]
pub struct RoomState {
    room_id: RoomId,
    /// Applied messages in op order. Insertion order is the only
    /// iteration order, which keeps replay deterministic.
    messages: Vec<ChatMessage>,
    /// `msg_id` to position in `messages`.
    index: HashMap<MsgId, usize>,
    /// `(author_id, client_sequence)` to the op that first carried it.
    idempotency: HashMap<(AuthorId, u64), OpNumber>,
    last_op: OpNumber,
    last_timestamp_us: u64,
    head_hash: Hash,
}

impl RoomState {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            messages: Vec::new(),
            index: HashMap::new(),
            idempotency: HashMap::new(),
            last_op: OpNumber::ZERO,
            last_timestamp_us: 0,
            head_hash: Hash::GENESIS,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn last_op(&self) -> OpNumber {
        self.last_op
    }

    pub fn last_timestamp_us(&self) -> u64 {
        self.last_timestamp_us
    }

    /// Hash of the most recently applied message record; `GENESIS` when
    /// the room is empty. The next message's `prev_hash` must equal this.
    pub fn head_hash(&self) -> Hash {
        self.head_hash
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Applied messages in op order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Looks up a message by its id.
    pub fn get(&self, msg_id: MsgId) -> Option<&ChatMessage> {
        self.index.get(&msg_id).map(|&pos| &self.messages[pos])
    }

    /// Returns the op recorded for an idempotency key, if any.
    pub fn dedup(&self, author_id: AuthorId, client_sequence: u64) -> Option<OpNumber> {
        self.idempotency.get(&(author_id, client_sequence)).copied()
    }

    /// Number of idempotency keys tracked for this room.
    pub fn idempotency_len(&self) -> usize {
        self.idempotency.len()
    }

    /// Applies the operation `op` carrying `message` to this room.
    ///
    /// Preconditions, checked in order:
    /// - `op` is exactly `last_op + 1` (sequential application)
    /// - the message belongs to this room (shard isolation)
    /// - the timestamp does not move backward
    /// - duplicate `(author_id, client_sequence)` pairs short-circuit
    ///   with `applied: false` and the original op, mutating nothing
    /// - room and idempotency table are under their bounds
    ///
    /// On success the message joins the sequence, the indexes are
    /// updated, and `head_hash` advances to the hash of this record.
    ///
    /// # Errors
    ///
    /// See [`RoomError`]; no state is mutated on any error path.
    pub fn apply(&mut self, op: OpNumber, message: &ChatMessage) -> Result<ApplyResult, RoomError> {
        if op != self.last_op.next() {
            return Err(RoomError::NonSequentialOp {
                op,
                last_op: self.last_op,
            });
        }

        if message.room_id != self.room_id {
            return Err(RoomError::WrongRoom {
                expected: self.room_id,
                got: message.room_id,
            });
        }

        if message.timestamp_us < self.last_timestamp_us {
            return Err(RoomError::TimestampNotMonotonic {
                timestamp_us: message.timestamp_us,
                last_timestamp_us: self.last_timestamp_us,
            });
        }

        let key = (message.author_id, message.client_sequence);
        if let Some(&existing_op) = self.idempotency.get(&key) {
            return Ok(ApplyResult {
                applied: false,
                op: existing_op,
            });
        }

        if self.messages.len() >= MAX_MESSAGES_PER_ROOM {
            return Err(RoomError::RoomFull);
        }
        if self.idempotency.len() >= MAX_IDEMPOTENCY_ENTRIES {
            return Err(RoomError::IdempotencyTableFull);
        }

        let hash = message.calculate_hash();
        let position = self.messages.len();

        self.messages.push(message.clone());
        self.index.insert(message.msg_id, position);
        self.idempotency.insert(key, op);
        self.last_op = op;
        self.last_timestamp_us = message.timestamp_us;
        self.head_hash = hash;

        // Postconditions: the sequence, the index, and the op counter
        // advanced together.
        debug_assert_eq!(self.messages.len(), self.index.len());
        debug_assert_eq!(self.messages.len() as u64, self.last_op.as_u64());
        debug_assert_eq!(self.head_hash, self.messages[position].calculate_hash());

        Ok(ApplyResult { applied: true, op })
    }
}
