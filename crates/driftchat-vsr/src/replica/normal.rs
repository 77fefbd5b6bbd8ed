//! Normal-case protocol handlers.
//!
//! Primary side: [`Replica::submit`] (client operations in) and
//! [`Replica::on_prepare_ok`] (quorum counting, commit advance).
//! Backup side: [`Replica::on_prepare`] (durable append + ack) and
//! [`Replica::on_commit`] (commit advance, doubles as the heartbeat).

use bytes::Bytes;
use driftchat_types::{
    MsgId, OpNumber, ReplicaId, MAX_IDEMPOTENCY_ENTRIES, MAX_MESSAGES_PER_ROOM,
};
use driftchat_wire::{ChatMessage, Command, Header};

use crate::instrumentation::METRICS;
use crate::tracker::PrepareTracker;

use super::{Output, Replica, ReplicaError, Status, SubmitReply, SubmitRequest, MAX_INFLIGHT_PREPARES};

impl Replica {
    // ========================================================================
    // Submit (primary)
    // ========================================================================

    /// Accepts a client operation.
    ///
    /// The op is durably logged and applied locally before the
    /// `Prepare` envelopes exist: a primary that crashes after this
    /// returns has the op on disk, and a prepared-but-uncommitted op is
    /// re-established or overwritten by the next view change's log
    /// merge.
    ///
    /// Duplicates by `(author_id, client_sequence)` short-circuit with
    /// the original op and touch neither the log nor the network.
    ///
    /// # Errors
    ///
    /// - [`ReplicaError::NotPrimary`] / [`ReplicaError::ViewChangeInProgress`]:
    ///   redirect or retry at the edge
    /// - [`ReplicaError::TooManyInflight`], `RoomFull`,
    ///   `IdempotencyTableFull`, `LogFull`: back-pressure
    pub fn submit(
        &mut self,
        request: &SubmitRequest,
        now_us: u64,
    ) -> Result<(SubmitReply, Output), ReplicaError> {
        if self.status == Status::ViewChange {
            return Err(ReplicaError::ViewChangeInProgress { view: self.view });
        }
        if !self.is_primary() || self.status != Status::Normal {
            return Err(ReplicaError::NotPrimary {
                view: self.view,
                primary: self.primary_id(),
            });
        }

        // Duplicate detection before any allocation of op numbers.
        let room_id = request.room_id;
        if let Some(existing_op) = self
            .rooms
            .get(&room_id)
            .and_then(|room| room.dedup(request.author_id, request.client_sequence))
        {
            let original = self
                .wal
                .read(existing_op)?
                .unwrap_or_else(|| unreachable!("idempotency table references logged op"));
            return Ok((
                SubmitReply {
                    applied: false,
                    op: existing_op,
                    msg_id: original.msg_id,
                    timestamp_us: original.timestamp_us,
                },
                Output::empty(),
            ));
        }

        // Resource bounds checked before the durable append so a
        // refused op leaves no trace.
        if self.trackers.len() >= MAX_INFLIGHT_PREPARES {
            return Err(ReplicaError::TooManyInflight);
        }
        {
            let room = self.get_or_create_room(room_id);
            if room.len() >= MAX_MESSAGES_PER_ROOM {
                return Err(driftchat_room::RoomError::RoomFull.into());
            }
            if room.idempotency_len() >= MAX_IDEMPOTENCY_ENTRIES {
                return Err(driftchat_room::RoomError::IdempotencyTableFull.into());
            }
        }

        let op = self.wal.last_op().next();
        let room = self.get_or_create_room(room_id);

        // The primary assigns time: monotone per room even if the wall
        // clock steps backward.
        let timestamp_us = now_us.max(room.last_timestamp_us());
        let msg_id = MsgId::from_parts(timestamp_us, op);
        let prev_hash = room.head_hash();

        let mut message = ChatMessage::new(
            room_id,
            msg_id,
            request.author_id,
            request.parent_id,
            timestamp_us,
            request.client_sequence,
            request.flags,
            &request.body,
        )?;
        message.prev_hash = prev_hash;
        message.seal();

        self.wal.append(op, &message)?;
        METRICS.fsync_latency_us.record(self.wal.last_fsync_micros());

        self.apply_to_room(op, &message)?;

        // Self-vote: the primary's durable append counts toward quorum.
        self.trackers
            .insert(op, PrepareTracker::new(op, self.config.replica_id, now_us));

        let mut output = Output::empty();
        let envelope = self.transport.seal(
            Command::Prepare,
            self.view,
            op,
            self.commit_num,
            timestamp_us,
            Bytes::copy_from_slice(&message.to_bytes()),
        )?;
        output.broadcast(envelope);

        tracing::debug!(
            replica = %self.config.replica_id,
            op = %op,
            room = %room_id,
            "accepted client operation"
        );

        Ok((
            SubmitReply {
                applied: true,
                op,
                msg_id,
                timestamp_us,
            },
            output,
        ))
    }

    // ========================================================================
    // Prepare handler (backup)
    // ========================================================================

    /// Handles a `Prepare` from the primary: durable append, local
    /// apply, `PrepareOk` back.
    pub(crate) fn on_prepare(
        &mut self,
        from: ReplicaId,
        header: &Header,
        message: ChatMessage,
        now_us: u64,
    ) -> Result<Output, ReplicaError> {
        if self.status != Status::Normal || self.is_primary() {
            return Ok(Output::empty());
        }

        if header.view != self.view {
            tracing::debug!(
                our_view = %self.view,
                msg_view = %header.view,
                "ignoring Prepare from another view"
            );
            return Ok(Output::empty());
        }

        if from != self.primary_id() {
            tracing::warn!(
                from = %from,
                primary = %self.primary_id(),
                "Prepare from non-primary"
            );
            return Ok(Output::empty());
        }

        if !message.verify_checksum() {
            tracing::warn!(op = %header.op, "Prepare record failed checksum");
            METRICS.increment_rejected_envelopes();
            return Ok(Output::empty());
        }

        let op = header.op;
        let expected = self.wal.last_op().next();

        let mut output = Output::empty();

        if op < expected {
            // Already logged; the primary may have missed our earlier
            // ack, so repeat it.
            let ack = self.transport.seal(
                Command::PrepareOk,
                self.view,
                op,
                self.commit_num,
                now_us,
                Bytes::new(),
            )?;
            output.send_to(from, ack);
            return Ok(output);
        }

        if op > expected {
            tracing::warn!(
                expected = %expected,
                got = %op,
                "gap in Prepare sequence"
            );
            return Ok(Output::empty());
        }

        self.wal.append(op, &message)?;
        METRICS.fsync_latency_us.record(self.wal.last_fsync_micros());
        self.apply_to_room(op, &message)?;
        self.timeout.record_prepare(now_us);

        let ack = self.transport.seal(
            Command::PrepareOk,
            self.view,
            op,
            self.commit_num,
            now_us,
            Bytes::new(),
        )?;
        output.send_to(from, ack);

        // The primary's commit number rides on every Prepare.
        output.committed = self.advance_commit(header.commit_num)?;

        Ok(output)
    }

    // ========================================================================
    // PrepareOk handler (primary)
    // ========================================================================

    /// Handles a backup's `PrepareOk`: records the vote and, at quorum,
    /// advances the commit number and broadcasts `Commit`.
    pub(crate) fn on_prepare_ok(
        &mut self,
        from: ReplicaId,
        header: &Header,
        now_us: u64,
    ) -> Result<Output, ReplicaError> {
        if !self.is_primary() || self.status != Status::Normal {
            return Ok(Output::empty());
        }
        if header.view != self.view {
            return Ok(Output::empty());
        }

        let op = header.op;
        let Some(tracker) = self.trackers.get_mut(&op) else {
            // Unknown or already committed op; a late or repeated ack.
            return Ok(Output::empty());
        };

        if !tracker.record(from) {
            return Ok(Output::empty());
        }
        if !tracker.has_quorum() {
            return Ok(Output::empty());
        }

        METRICS
            .prepare_latency_us
            .record(now_us.saturating_sub(tracker.started_at_us()));

        // Quorum: everything up to and including this op is committed
        // (a backup acking op n holds every op below n).
        let mut output = Output::empty();
        output.committed = self.advance_commit(op.into())?;

        // Trackers at or below the new commit point are settled.
        self.trackers = self.trackers.split_off(&op.next());

        let commit = self.transport.seal(
            Command::Commit,
            self.view,
            op,
            self.commit_num,
            now_us,
            Bytes::new(),
        )?;
        output.broadcast(commit);
        self.last_commit_broadcast_us = now_us;

        Ok(output)
    }

    // ========================================================================
    // Commit handler (backup)
    // ========================================================================

    /// Handles a `Commit` from the primary: advances the local commit
    /// number (bounded by what is durably logged here) and resets the
    /// prepare timer, since a commit proves the primary is alive.
    pub(crate) fn on_commit(
        &mut self,
        from: ReplicaId,
        header: &Header,
        now_us: u64,
    ) -> Result<Output, ReplicaError> {
        if self.status != Status::Normal || self.is_primary() {
            return Ok(Output::empty());
        }
        if header.view != self.view || from != self.primary_id() {
            return Ok(Output::empty());
        }

        self.timeout.record_prepare(now_us);

        let mut output = Output::empty();
        output.committed = self.advance_commit(header.commit_num)?;
        Ok(output)
    }

    // ========================================================================
    // Op assignment invariant
    // ========================================================================

    /// The op the next accepted submission will receive.
    pub fn next_op(&self) -> OpNumber {
        self.wal.last_op().next()
    }
}
