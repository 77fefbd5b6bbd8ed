//! # driftchat-types: Core types for driftchat
//!
//! Shared types used across the driftchat consensus core:
//! - Entity IDs ([`RoomId`], [`MsgId`], [`AuthorId`], [`ReplicaId`], [`ClusterId`])
//! - Protocol counters ([`OpNumber`], [`ViewNumber`], [`CommitNumber`], [`Nonce`])
//! - Cryptographic types ([`struct@Hash`])
//! - Resource bounds shared by every crate in the workspace
//!
//! All ID types are `Copy` newtypes over fixed-width integers so that the
//! wire and disk layouts stay pinned regardless of how the compiler lays
//! out the surrounding structs.

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Resource bounds
// ============================================================================

/// Cluster size. The replication protocol is specialized to three replicas.
pub const CLUSTER_SIZE: u8 = 3;

/// Quorum size for a three-replica cluster (majority).
pub const QUORUM: usize = 2;

/// Upper bound on applied messages retained per room.
pub const MAX_MESSAGES_PER_ROOM: usize = 1_000_000;

/// Upper bound on idempotency table entries per room.
pub const MAX_IDEMPOTENCY_ENTRIES: usize = 100_000;

/// Upper bound on concurrently open sockets per process.
pub const MAX_CONNECTIONS: usize = 64;

/// Upper bound on configurable WAL capacity.
pub const MAX_WAL_ENTRIES: u64 = 10_000_000;

/// Upper bound on an envelope body on the wire (1 MiB).
pub const MAX_ENVELOPE_BODY: usize = 1024 * 1024;

/// Upper bound on a chat message body in bytes.
pub const MAX_BODY_LEN: usize = 2048;

// ============================================================================
// Entity IDs
// ============================================================================

/// Unique identifier for a chat room (the shard key).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RoomId(u128);

impl RoomId {
    pub fn new(id: u128) -> Self {
        Self(id)
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for RoomId {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<RoomId> for u128 {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

/// Time-ordered unique identifier for a chat message.
///
/// The primary assigns these: the high 64 bits are the assigned
/// `timestamp_us`, the low 64 bits the operation number, so IDs sort in
/// commit order within a room.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MsgId(u128);

impl MsgId {
    /// The zero ID, used as `parent_id` for top-level messages.
    pub const NONE: MsgId = MsgId(0);

    pub fn new(id: u128) -> Self {
        Self(id)
    }

    /// Builds a time-ordered ID from the assigned timestamp and op number.
    pub fn from_parts(timestamp_us: u64, op: OpNumber) -> Self {
        Self((u128::from(timestamp_us) << 64) | u128::from(op.as_u64()))
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<u128> for MsgId {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<MsgId> for u128 {
    fn from(id: MsgId) -> Self {
        id.0
    }
}

/// Unique identifier for a message author.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AuthorId(u64);

impl AuthorId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for AuthorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AuthorId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<AuthorId> for u64 {
    fn from(id: AuthorId) -> Self {
        id.0
    }
}

/// Identifier for a replica within the cluster, in `{0, 1, 2}`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(u8);

impl ReplicaId {
    /// Creates a replica ID.
    ///
    /// # Panics
    ///
    /// Panics if `id >= CLUSTER_SIZE`; replica identity is fixed at
    /// configuration time and an out-of-range value is a config bug.
    pub fn new(id: u8) -> Self {
        assert!(id < CLUSTER_SIZE, "replica id {id} out of range");
        Self(id)
    }

    /// Fallible constructor for values read off the wire.
    pub fn try_new(id: u8) -> Option<Self> {
        (id < CLUSTER_SIZE).then_some(Self(id))
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }

    /// Iterates over every replica ID in the cluster.
    pub fn all() -> impl Iterator<Item = ReplicaId> {
        (0..CLUSTER_SIZE).map(ReplicaId)
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 128-bit cluster identifier. Envelopes from a different cluster are
/// rejected at the transport layer (cluster isolation).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClusterId(u128);

impl ClusterId {
    pub fn new(id: u128) -> Self {
        Self(id)
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<u128> for ClusterId {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

// ============================================================================
// Protocol counters
// ============================================================================

/// Operation number: the log index assigned by the primary.
///
/// Op numbers start at 1; zero means "no operations yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OpNumber(u64);

impl OpNumber {
    pub const ZERO: OpNumber = OpNumber(0);

    pub fn new(op: u64) -> Self {
        Self(op)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The next op number in sequence.
    pub fn next(self) -> OpNumber {
        OpNumber(self.0 + 1)
    }
}

impl Display for OpNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OpNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<OpNumber> for u64 {
    fn from(op: OpNumber) -> Self {
        op.0
    }
}

/// View number: the epoch during which one replica is primary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(u32);

impl ViewNumber {
    pub const ZERO: ViewNumber = ViewNumber(0);

    pub fn new(view: u32) -> Self {
        Self(view)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn next(self) -> ViewNumber {
        ViewNumber(self.0 + 1)
    }

    /// The primary for this view: `view mod N`. Deterministic leader
    /// selection keeps every replica's view of leadership consistent
    /// without coordination.
    pub fn primary(self) -> ReplicaId {
        ReplicaId::new((self.0 % u32::from(CLUSTER_SIZE)) as u8)
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ViewNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Commit number: the highest op known quorum-durable and safe to apply.
///
/// Invariant maintained by the replica: `commit_num <= wal.last_op`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CommitNumber(u64);

impl CommitNumber {
    pub const ZERO: CommitNumber = CommitNumber(0);

    pub fn new(commit: u64) -> Self {
        Self(commit)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_op_number(self) -> OpNumber {
        OpNumber(self.0)
    }
}

impl Display for CommitNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CommitNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<OpNumber> for CommitNumber {
    fn from(op: OpNumber) -> Self {
        Self(op.0)
    }
}

/// Sender-monotonic envelope nonce, used for replay rejection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Nonce(u64);

impl Nonce {
    pub const ZERO: Nonce = Nonce(0);

    pub fn new(nonce: u64) -> Self {
        Self(nonce)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Nonce {
        Nonce(self.0 + 1)
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Cryptographic Hash
// ============================================================================

/// Length of cryptographic hashes in bytes (SHA-256).
pub const HASH_LENGTH: usize = 32;

/// A 32-byte cryptographic hash.
///
/// Used for the per-room hash chain (`prev_hash` in message records and
/// `head_hash` in room state). The algorithm is SHA-256 throughout; this
/// type only stores the digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// The genesis hash (all zeros), used as `prev_hash` for the first
    /// message in a room.
    pub const GENESIS: Hash = Hash([0u8; HASH_LENGTH]);

    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn is_genesis(&self) -> bool {
        self.0 == [0u8; HASH_LENGTH]
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::GENESIS
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes are enough to tell hashes apart in logs
        write!(
            f,
            "Hash({:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]
        )
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
