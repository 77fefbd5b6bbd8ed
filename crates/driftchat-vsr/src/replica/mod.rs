//! The replica: state, dispatch, and shared transitions.
//!
//! One [`Replica`] owns everything durable and deterministic about a
//! cluster member: the write-ahead log, the room table, the per-sender
//! nonce table, and the view/commit/status registers. Message handlers
//! live in the sibling modules ([`normal`] for the steady state,
//! [`view_change`] for elections); each consumes a verified envelope
//! and produces an [`Output`] of envelopes to send and operations that
//! just committed.
//!
//! The replica never reads the clock: callers pass `now_us` into every
//! entry point, which is what makes the protocol replayable in tests.

mod normal;
mod view_change;

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use driftchat_room::RoomState;
use driftchat_storage::{Wal, WalError};
use driftchat_types::{
    CommitNumber, MsgId, Nonce, OpNumber, ReplicaId, RoomId, ViewNumber, CLUSTER_SIZE,
};
use driftchat_wire::{ChatMessage, Command, Envelope, Header, Transport, WireError};
use thiserror::Error;

use crate::config::ClusterConfig;
use crate::instrumentation::METRICS;
use crate::message::LogSummary;
use crate::tracker::{Election, PrepareTracker, TimeoutTracker, VoteAccumulator};

/// Bound on concurrently in-flight prepares at the primary. Submissions
/// beyond this are refused until commits drain the pipeline.
pub const MAX_INFLIGHT_PREPARES: usize = 64;

// ============================================================================
// Status
// ============================================================================

/// Replica lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Serving the protocol in the current view.
    Normal,
    /// Participating in a view change; normal traffic is refused.
    ViewChange,
    /// Replaying the write-ahead log at startup.
    Recovering,
}

// ============================================================================
// Output
// ============================================================================

/// An envelope to put on the wire.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// `None` broadcasts to both peers.
    pub to: Option<ReplicaId>,
    pub envelope: Envelope,
}

/// An operation that just became committed on this replica.
#[derive(Debug, Clone)]
pub struct Committed {
    pub room_id: RoomId,
    pub op: OpNumber,
    pub message: ChatMessage,
}

/// A signed record of one completed view change, handed to the
/// external audit log.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub replica_id: ReplicaId,
    pub view: ViewNumber,
    pub last_op: OpNumber,
    pub commit_num: CommitNumber,
    pub timestamp_us: u64,
    /// Ed25519 signature over the record's canonical bytes under this
    /// replica's key.
    pub signature: [u8; 64],
}

impl AuditRecord {
    /// The byte string the signature covers.
    pub fn signed_bytes(
        replica_id: ReplicaId,
        view: ViewNumber,
        last_op: OpNumber,
        commit_num: CommitNumber,
        timestamp_us: u64,
    ) -> [u8; 29] {
        let mut buf = [0u8; 29];
        buf[0] = replica_id.as_u8();
        buf[1..5].copy_from_slice(&view.as_u32().to_le_bytes());
        buf[5..13].copy_from_slice(&last_op.as_u64().to_le_bytes());
        buf[13..21].copy_from_slice(&commit_num.as_u64().to_le_bytes());
        buf[21..29].copy_from_slice(&timestamp_us.to_le_bytes());
        buf
    }
}

/// Result of processing one event.
///
/// The caller sends the envelopes and feeds `committed` to the fan-out
/// sink, in order. Commit entries appear exactly once across a
/// replica's lifetime: they are produced only when `commit_num` crosses
/// the op, and `commit_num` never regresses.
#[derive(Debug, Default)]
pub struct Output {
    pub outbound: Vec<Outbound>,
    pub committed: Vec<Committed>,
    /// Signed view-change records for the audit log.
    pub audit: Vec<AuditRecord>,
}

impl Output {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.committed.is_empty() && self.audit.is_empty()
    }

    pub fn merge(&mut self, other: Output) {
        self.outbound.extend(other.outbound);
        self.committed.extend(other.committed);
        self.audit.extend(other.audit);
    }

    pub(crate) fn send_to(&mut self, to: ReplicaId, envelope: Envelope) {
        self.outbound.push(Outbound {
            to: Some(to),
            envelope,
        });
    }

    pub(crate) fn broadcast(&mut self, envelope: Envelope) {
        self.outbound.push(Outbound { to: None, envelope });
    }
}

/// Consumer of committed operations (the fan-out bus seam).
///
/// Invoked exactly once per committed op, in op order, on every
/// replica.
pub trait CommitSink {
    fn on_commit(&mut self, room_id: RoomId, op: OpNumber, message: &ChatMessage);
}

// ============================================================================
// Submit contract (edge gateway seam)
// ============================================================================

/// A client operation as handed over by the edge gateway.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub room_id: RoomId,
    pub author_id: driftchat_types::AuthorId,
    pub client_sequence: u64,
    pub parent_id: MsgId,
    pub flags: u32,
    pub body: Bytes,
}

/// The core's answer to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReply {
    /// False when this was a duplicate of an earlier submission; `op`,
    /// `msg_id`, and `timestamp_us` then describe the original.
    pub applied: bool,
    pub op: OpNumber,
    pub msg_id: MsgId,
    pub timestamp_us: u64,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the replica.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Room(#[from] driftchat_room::RoomError),

    /// Submission reached a replica that is not the primary. Carries
    /// the current view so the edge can redirect.
    #[error("not primary (view {view}, primary is replica {primary})")]
    NotPrimary {
        view: ViewNumber,
        primary: ReplicaId,
    },

    /// Submission arrived while a view change is running.
    #[error("view change in progress (view {view})")]
    ViewChangeInProgress { view: ViewNumber },

    /// The prepare pipeline is full; back-pressure upstream.
    #[error("too many in-flight prepares")]
    TooManyInflight,

    /// `StartView` carried a view older than ours.
    #[error("old view {view}, current is {current}")]
    OldView {
        view: ViewNumber,
        current: ViewNumber,
    },

    /// `StartView` arrived while not in a view change.
    #[error("not in view change state")]
    NotInViewChangeState,
}

// ============================================================================
// Replica
// ============================================================================

/// A cluster member: durable log, room table, and protocol registers.
pub struct Replica {
    pub(crate) config: ClusterConfig,
    pub(crate) transport: Transport,
    pub(crate) wal: Wal,
    /// Room table; `BTreeMap` so iteration order is deterministic.
    pub(crate) rooms: BTreeMap<RoomId, RoomState>,
    /// Highest accepted inbound nonce per sender.
    pub(crate) last_seen_nonce: [Nonce; CLUSTER_SIZE as usize],
    pub(crate) status: Status,
    pub(crate) view: ViewNumber,
    pub(crate) commit_num: CommitNumber,
    /// In-flight prepare trackers, primary only. Dropped wholesale on
    /// any view transition.
    pub(crate) trackers: BTreeMap<OpNumber, PrepareTracker>,
    pub(crate) timeout: TimeoutTracker,
    pub(crate) votes: Option<VoteAccumulator>,
    pub(crate) sent_do_view_change: bool,
    pub(crate) election: Option<Election>,
    /// When this primary last broadcast a commit (commits double as
    /// heartbeats on an idle cluster).
    pub(crate) last_commit_broadcast_us: u64,
    /// Wall time when the current view change began, for the duration
    /// histogram and budget alert.
    pub(crate) view_change_started_us: u64,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("replica_id", &self.config.replica_id)
            .field("status", &self.status)
            .field("view", &self.view)
            .field("commit_num", &self.commit_num)
            .field("last_op", &self.wal.last_op())
            .finish_non_exhaustive()
    }
}

impl Replica {
    /// Opens the replica: recovers the write-ahead log, rebuilds every
    /// room by replaying it, and enters normal status.
    ///
    /// Recovery marks every durably logged op as committed
    /// (`commit_num = last_op`); the next view change re-establishes
    /// the cluster-wide commit point.
    pub fn open(
        config: ClusterConfig,
        transport: Transport,
        wal_path: impl AsRef<Path>,
        wal_max_entries: u64,
    ) -> Result<Self, ReplicaError> {
        let wal = Wal::open(wal_path.as_ref(), wal_max_entries)?;
        Self::from_wal(config, transport, wal)
    }

    /// Builds a replica over an already-opened log (tests).
    pub fn from_wal(
        config: ClusterConfig,
        transport: Transport,
        wal: Wal,
    ) -> Result<Self, ReplicaError> {
        let mut replica = Self {
            config,
            transport,
            wal,
            rooms: BTreeMap::new(),
            last_seen_nonce: [Nonce::ZERO; CLUSTER_SIZE as usize],
            status: Status::Recovering,
            view: ViewNumber::ZERO,
            commit_num: CommitNumber::ZERO,
            trackers: BTreeMap::new(),
            timeout: TimeoutTracker::new(),
            votes: None,
            sent_do_view_change: false,
            election: None,
            last_commit_broadcast_us: 0,
            view_change_started_us: 0,
        };

        replica.rebuild_rooms()?;
        replica.commit_num = CommitNumber::from(replica.wal.last_op());
        replica.status = Status::Normal;

        METRICS.set_view(replica.view.as_u32().into());
        METRICS.set_commit_number(replica.commit_num.as_u64());

        tracing::info!(
            replica = %replica.config.replica_id,
            last_op = %replica.wal.last_op(),
            rooms = replica.rooms.len(),
            "replica recovered"
        );
        Ok(replica)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn commit_num(&self) -> CommitNumber {
        self.commit_num
    }

    pub fn last_op(&self) -> OpNumber {
        self.wal.last_op()
    }

    /// The primary for the current view: `view mod 3`.
    pub fn primary_id(&self) -> ReplicaId {
        self.view.primary()
    }

    pub fn is_primary(&self) -> bool {
        self.primary_id() == self.config.replica_id
    }

    pub fn room(&self, room_id: RoomId) -> Option<&RoomState> {
        self.rooms.get(&room_id)
    }

    /// Returns the room's state, creating an empty one on first use.
    pub fn get_or_create_room(&mut self, room_id: RoomId) -> &mut RoomState {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| RoomState::new(room_id))
    }

    // ========================================================================
    // Envelope admission
    // ========================================================================

    /// True iff the envelope belongs to our cluster.
    pub fn verify_cluster(&self, header: &Header) -> bool {
        header.cluster_id == self.transport.cluster_id()
    }

    /// Nonce admission: accepts iff `nonce` strictly exceeds the last
    /// accepted nonce from `sender`, and records it on acceptance.
    /// Rejection leaves the table untouched.
    pub fn verify_nonce(&mut self, sender: ReplicaId, nonce: Nonce) -> bool {
        let slot = &mut self.last_seen_nonce[sender.as_usize()];
        if nonce <= *slot {
            return false;
        }
        *slot = nonce;
        true
    }

    /// Verifies and dispatches one received envelope.
    ///
    /// Transport verification (cluster, sender, checksum, signature)
    /// and the nonce check run before any handler sees the message;
    /// rejected envelopes mutate nothing. Edge-tagged envelopes are not
    /// interpreted here and produce no output.
    pub fn handle_envelope(
        &mut self,
        envelope: &Envelope,
        now_us: u64,
    ) -> Result<Output, ReplicaError> {
        // Cluster isolation first: foreign traffic is rejected before
        // any signature work is spent on it.
        if !self.verify_cluster(&envelope.header) {
            METRICS.increment_rejected_envelopes();
            return Err(WireError::ClusterIdMismatch.into());
        }

        if let Err(err) = self.transport.verify(envelope) {
            METRICS.increment_rejected_envelopes();
            return Err(err.into());
        }

        let header = envelope.header;
        let sender = ReplicaId::try_new(header.replica_id)
            .expect("sender range was checked by transport verify");

        if !self.verify_nonce(sender, header.nonce) {
            METRICS.increment_rejected_envelopes();
            return Err(WireError::ReplayedNonce {
                sender: sender.as_u8(),
                nonce: header.nonce.as_u64(),
            }
            .into());
        }

        match header.command {
            Command::Prepare => {
                let message = ChatMessage::from_bytes(&envelope.body)?;
                self.on_prepare(sender, &header, message, now_us)
            }
            Command::PrepareOk => self.on_prepare_ok(sender, &header, now_us),
            Command::Commit => self.on_commit(sender, &header, now_us),
            Command::StartViewChange => self.on_start_view_change(sender, &header, now_us),
            Command::DoViewChange => {
                let summary = LogSummary::decode_body(&envelope.body)?;
                self.on_do_view_change(sender, &header, summary, now_us)
            }
            Command::StartView => {
                let summary = LogSummary::decode_body(&envelope.body)?;
                self.on_start_view(sender, &header, summary, now_us)
            }
            // Edge traffic is the gateway's to route; the core carries
            // it opaquely.
            command if command.is_edge() => Ok(Output::empty()),
            _ => unreachable!("command classification is total"),
        }
    }

    // ========================================================================
    // Shared transitions
    // ========================================================================

    /// Advances `commit_num` to `min(to, wal.last_op)`, collecting each
    /// newly committed op for the fan-out sink.
    pub(crate) fn advance_commit(&mut self, to: CommitNumber) -> Result<Vec<Committed>, ReplicaError> {
        let ceiling = CommitNumber::from(self.wal.last_op());
        let target = to.min(ceiling);
        if target <= self.commit_num {
            return Ok(Vec::new());
        }

        let mut committed = Vec::new();
        let mut op = self.commit_num.as_op_number().next();
        while op <= target.as_op_number() {
            match self.wal.read(op)? {
                Some(message) => {
                    committed.push(Committed {
                        room_id: message.room_id,
                        op,
                        message,
                    });
                }
                // A hole below last_op would mean the recovery scan and
                // the index disagree.
                None => unreachable!("op {op} below last_op missing from log"),
            }
            op = op.next();
        }

        self.commit_num = target;
        for _ in &committed {
            METRICS.increment_commits();
        }
        METRICS.set_commit_number(self.commit_num.as_u64());

        debug_assert!(self.commit_num <= CommitNumber::from(self.wal.last_op()));
        Ok(committed)
    }

    /// Applies a logged operation to its room, creating the room on
    /// first touch. Duplicate idempotency keys are a no-op.
    pub(crate) fn apply_to_room(
        &mut self,
        op: OpNumber,
        message: &ChatMessage,
    ) -> Result<(), ReplicaError> {
        let room = self.get_or_create_room(message.room_id);
        let result = room.apply(op, message)?;
        if !result.applied {
            tracing::debug!(
                op = %op,
                original = %result.op,
                "duplicate idempotency key during apply"
            );
        }
        Ok(())
    }

    /// Clears and rebuilds every room by replaying the log from op 1.
    /// The same path serves startup recovery and post-merge
    /// reinstallation, so both produce identical state.
    pub(crate) fn rebuild_rooms(&mut self) -> Result<(), ReplicaError> {
        self.rooms.clear();
        let mut op = OpNumber::new(1);
        while op <= self.wal.last_op() {
            let message = self
                .wal
                .read(op)?
                .unwrap_or_else(|| unreachable!("recovered log has no holes"));
            self.apply_to_room(op, &message)?;
            op = op.next();
        }
        Ok(())
    }

    /// Enters the view-change state for `new_view`.
    ///
    /// # Panics
    ///
    /// Panics if `new_view` does not exceed the current view; callers
    /// gate on that, so a violation is a protocol bug.
    pub(crate) fn start_view_change(&mut self, new_view: ViewNumber, now_us: u64) {
        assert!(
            new_view > self.view,
            "view change to {new_view} from {view}",
            view = self.view
        );

        self.status = Status::ViewChange;
        self.view = new_view;
        // In-flight prepares cannot complete across views; their ops
        // are re-established or overwritten by the log merge.
        self.trackers.clear();
        self.sent_do_view_change = false;
        self.election = None;

        let mut votes = VoteAccumulator::new(new_view);
        votes.record(self.config.replica_id);
        self.votes = Some(votes);

        self.view_change_started_us = now_us;
        METRICS.increment_view_changes();
        METRICS.set_view(new_view.as_u32().into());

        tracing::info!(
            replica = %self.config.replica_id,
            view = %new_view,
            "starting view change"
        );
    }

    /// Leaves the view-change state into normal status at `new_view`.
    ///
    /// Returns the signed audit record for this view change.
    ///
    /// # Panics
    ///
    /// Panics if `new_view` is below the current view.
    pub(crate) fn complete_view_change(&mut self, new_view: ViewNumber, now_us: u64) -> AuditRecord {
        assert!(
            new_view >= self.view,
            "completing view change to {new_view} below {view}",
            view = self.view
        );

        self.status = Status::Normal;
        self.view = new_view;
        self.votes = None;
        self.sent_do_view_change = false;
        self.election = None;
        // Installation is evidence of a live primary; without this a
        // survivor would immediately re-suspect the new view.
        self.timeout.record_prepare(now_us);

        let duration = now_us.saturating_sub(self.view_change_started_us);
        METRICS.view_change_duration_us.record(duration);
        METRICS.set_view(new_view.as_u32().into());
        if duration > self.config.view_change_timeout_us {
            tracing::warn!(
                view = %new_view,
                duration_us = duration,
                budget_us = self.config.view_change_timeout_us,
                "view change exceeded its budget"
            );
        }

        tracing::info!(
            replica = %self.config.replica_id,
            view = %new_view,
            last_op = %self.wal.last_op(),
            commit = %self.commit_num,
            "view change complete"
        );

        let replica_id = self.config.replica_id;
        let last_op = self.wal.last_op();
        let signed = AuditRecord::signed_bytes(
            replica_id,
            new_view,
            last_op,
            self.commit_num,
            now_us,
        );
        AuditRecord {
            replica_id,
            view: new_view,
            last_op,
            commit_num: self.commit_num,
            timestamp_us: now_us,
            signature: self.transport.sign(&signed),
        }
    }

    /// Builds this replica's log summary: `last_op`, `commit_num`, and
    /// the uncommitted suffix.
    pub(crate) fn log_summary(&self) -> Result<LogSummary, ReplicaError> {
        let suffix = self
            .wal
            .read_range(self.commit_num.as_op_number(), self.wal.last_op())?;
        Ok(LogSummary::new(self.wal.last_op(), self.commit_num, suffix))
    }
}
