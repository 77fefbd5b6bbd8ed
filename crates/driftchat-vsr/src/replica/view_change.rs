//! View-change protocol handlers.
//!
//! Four cooperating pieces:
//!
//! 1. **Initiation** ([`Replica::tick`]): a backup whose prepare timer
//!    expired enters the next view and broadcasts `StartViewChange`.
//! 2. **Vote accumulation** ([`Replica::on_start_view_change`]): at a
//!    quorum of votes the replica sends its log state to the new view's
//!    primary via `DoViewChange`.
//! 3. **Election** ([`Replica::on_do_view_change`]): the prospective
//!    primary collects a quorum of log states, installs the maximum by
//!    `(last_op, commit_num)` with its carried uncommitted suffix, and
//!    broadcasts `StartView`.
//! 4. **Installation** ([`Replica::on_start_view`]): every replica
//!    installs the merged state and returns to normal status.
//!
//! Safety: a committed op appears in the log of at least a quorum, any
//! two quorums intersect, and the merge picks a maximal log, so the
//! committed prefix survives every election.

use bytes::Bytes;
use driftchat_types::{OpNumber, ReplicaId, ViewNumber};
use driftchat_wire::{Command, Header};

use crate::message::LogSummary;
use crate::tracker::{Election, PrepareTracker};

use super::{Output, Replica, ReplicaError, Status};

impl Replica {
    // ========================================================================
    // Periodic driving
    // ========================================================================

    /// Periodic housekeeping, called by the event loop between polls.
    ///
    /// Backups check the prepare timer and initiate a view change on
    /// expiry. An idle primary re-broadcasts its commit number at half
    /// the prepare timeout so backups keep observing liveness.
    pub fn tick(&mut self, now_us: u64) -> Result<Output, ReplicaError> {
        if self.status != Status::Normal {
            return Ok(Output::empty());
        }

        if self.is_primary() {
            let interval = self.config.prepare_timeout_us / 2;
            if now_us.saturating_sub(self.last_commit_broadcast_us) >= interval {
                self.last_commit_broadcast_us = now_us;
                let heartbeat = self.transport.seal(
                    Command::Commit,
                    self.view,
                    self.commit_num.as_op_number(),
                    self.commit_num,
                    now_us,
                    Bytes::new(),
                )?;
                let mut output = Output::empty();
                output.broadcast(heartbeat);
                return Ok(output);
            }
            return Ok(Output::empty());
        }

        if self
            .timeout
            .has_timed_out(now_us, self.config.prepare_timeout_us)
        {
            tracing::warn!(
                replica = %self.config.replica_id,
                view = %self.view,
                "prepare timeout, suspecting primary"
            );
            return self.initiate_view_change(self.view.next(), now_us);
        }

        Ok(Output::empty())
    }

    /// Enters the view-change state for `new_view` and broadcasts
    /// `StartViewChange`.
    fn initiate_view_change(
        &mut self,
        new_view: ViewNumber,
        now_us: u64,
    ) -> Result<Output, ReplicaError> {
        self.start_view_change(new_view, now_us);

        let mut output = Output::empty();
        let svc = self.transport.seal(
            Command::StartViewChange,
            new_view,
            self.wal.last_op(),
            self.commit_num,
            now_us,
            Bytes::new(),
        )?;
        output.broadcast(svc);

        // With our own vote counted, a single peer vote completes the
        // quorum; in a two-survivor cluster the peer's broadcast may
        // already be in flight.
        Ok(output)
    }

    // ========================================================================
    // StartViewChange handler
    // ========================================================================

    /// Handles a peer's `StartViewChange` vote.
    pub(crate) fn on_start_view_change(
        &mut self,
        from: ReplicaId,
        header: &Header,
        now_us: u64,
    ) -> Result<Output, ReplicaError> {
        let vote_view = header.view;

        if vote_view < self.view {
            return Ok(Output::empty());
        }

        let mut output = Output::empty();

        if vote_view > self.view {
            // A peer is ahead of us; adopt its pending view.
            output.merge(self.initiate_view_change(vote_view, now_us)?);
        } else if self.status != Status::ViewChange {
            // A vote for our current, completed view is stale.
            return Ok(Output::empty());
        }

        if let Some(votes) = self.votes.as_mut() {
            if votes.view() == vote_view {
                votes.record(from);
            }
        }

        output.merge(self.check_vote_quorum(now_us)?);
        Ok(output)
    }

    /// At a quorum of `StartViewChange` votes, sends this replica's log
    /// state to the new primary (once per view).
    fn check_vote_quorum(&mut self, now_us: u64) -> Result<Output, ReplicaError> {
        let Some(votes) = self.votes.as_ref() else {
            return Ok(Output::empty());
        };
        if !votes.has_quorum() || self.sent_do_view_change {
            return Ok(Output::empty());
        }
        self.sent_do_view_change = true;

        let view = self.view;
        let summary = self.log_summary()?;
        let new_primary = view.primary();

        tracing::info!(
            replica = %self.config.replica_id,
            view = %view,
            last_op = %summary.last_op,
            commit = %summary.commit_num,
            new_primary = %new_primary,
            "sending log state to new primary"
        );

        if new_primary == self.config.replica_id {
            // We are the prospective primary: our own log state joins
            // the election directly rather than via the network.
            return self.record_do_view_change(self.config.replica_id, view, summary, now_us);
        }

        let body = summary.encode_body();
        let dvc = self.transport.seal(
            Command::DoViewChange,
            view,
            summary.last_op,
            summary.commit_num,
            now_us,
            body,
        )?;
        let mut output = Output::empty();
        output.send_to(new_primary, dvc);
        Ok(output)
    }

    // ========================================================================
    // DoViewChange handler (prospective primary)
    // ========================================================================

    /// Handles a replica's `DoViewChange` log state.
    pub(crate) fn on_do_view_change(
        &mut self,
        from: ReplicaId,
        header: &Header,
        summary: LogSummary,
        now_us: u64,
    ) -> Result<Output, ReplicaError> {
        let vote_view = header.view;

        // Only the primary for that view collects log states.
        if vote_view.primary() != self.config.replica_id {
            return Ok(Output::empty());
        }

        if vote_view < self.view {
            return Ok(Output::empty());
        }

        let mut output = Output::empty();
        if vote_view > self.view {
            // We have not noticed the view change yet; join it.
            output.merge(self.initiate_view_change(vote_view, now_us)?);
        }

        if self.status != Status::ViewChange {
            // Already completed this view; a straggler's state is moot.
            return Ok(output);
        }

        output.merge(self.record_do_view_change(from, vote_view, summary, now_us)?);
        Ok(output)
    }

    /// Records one log state into the election; at quorum, installs the
    /// merged state and broadcasts `StartView`.
    fn record_do_view_change(
        &mut self,
        from: ReplicaId,
        view: ViewNumber,
        summary: LogSummary,
        now_us: u64,
    ) -> Result<Output, ReplicaError> {
        let stale = !matches!(self.election.as_ref(), Some(e) if e.view() == view);
        if stale {
            self.election = Some(Election::new(view, now_us));
        }
        let election = self.election.as_mut().expect("election exists for this view");

        election.record(from, summary);
        if !election.has_quorum() {
            return Ok(Output::empty());
        }

        let merged = election
            .merged()
            .expect("quorum implies at least one record")
            .clone();
        self.election = None;

        tracing::info!(
            replica = %self.config.replica_id,
            view = %view,
            merged_last_op = %merged.last_op,
            merged_commit = %merged.commit_num,
            "quorum of log states, installing merged log"
        );

        let mut output = self.install_log_state(&merged)?;
        output.audit.push(self.complete_view_change(view, now_us));
        self.last_commit_broadcast_us = now_us;

        // Re-open trackers for the installed-but-uncommitted suffix;
        // backups ack it on StartView and the acks complete here.
        let mut op = self.commit_num.as_op_number().next();
        while op <= self.wal.last_op() {
            self.trackers
                .insert(op, PrepareTracker::new(op, self.config.replica_id, now_us));
            op = op.next();
        }

        // Broadcast the authoritative state, rebuilt from our now
        // merged log so the suffix reflects what was installed.
        let installed = self.log_summary()?;
        let body = installed.encode_body();
        let start_view = self.transport.seal(
            Command::StartView,
            view,
            installed.last_op,
            installed.commit_num,
            now_us,
            body,
        )?;
        output.broadcast(start_view);
        Ok(output)
    }

    // ========================================================================
    // StartView handler (all replicas)
    // ========================================================================

    /// Handles the new primary's `StartView`: installs the merged log
    /// state and returns to normal status.
    ///
    /// # Errors
    ///
    /// - [`ReplicaError::OldView`] if the view regressed
    /// - [`ReplicaError::NotInViewChangeState`] if no view change is in
    ///   progress here
    pub(crate) fn on_start_view(
        &mut self,
        from: ReplicaId,
        header: &Header,
        summary: LogSummary,
        now_us: u64,
    ) -> Result<Output, ReplicaError> {
        let new_view = header.view;

        if new_view < self.view {
            return Err(ReplicaError::OldView {
                view: new_view,
                current: self.view,
            });
        }
        if self.status != Status::ViewChange {
            return Err(ReplicaError::NotInViewChangeState);
        }
        if from != new_view.primary() {
            tracing::warn!(
                from = %from,
                claimed_view = %new_view,
                "StartView from a replica that is not that view's primary"
            );
            return Ok(Output::empty());
        }

        let mut output = self.install_log_state(&summary)?;
        output.audit.push(self.complete_view_change(new_view, now_us));

        // Ack the installed-but-uncommitted suffix so the new primary
        // can commit it without waiting for fresh client traffic. One
        // ack for the highest op covers the prefix below it.
        if self.wal.last_op() > self.commit_num.as_op_number() {
            let ack = self.transport.seal(
                Command::PrepareOk,
                new_view,
                self.wal.last_op(),
                self.commit_num,
                now_us,
                Bytes::new(),
            )?;
            output.send_to(from, ack);
        }
        Ok(output)
    }

    // ========================================================================
    // Log installation
    // ========================================================================

    /// Installs a merged log state: reconciles our log with the carried
    /// uncommitted suffix, then advances the commit number.
    ///
    /// Three reconciliations, in order:
    /// - a local uncommitted suffix beyond `merged.last_op` is truncated
    /// - a local entry that differs byte-for-byte from the merged entry
    ///   at the same op is truncated away with everything after it
    /// - merged entries we lack are appended from the carried suffix
    ///
    /// Whenever truncation rewrote history, every room is rebuilt by
    /// replay so room state matches the log exactly.
    fn install_log_state(&mut self, merged: &LogSummary) -> Result<Output, ReplicaError> {
        let mut rewrote = false;

        // Discard our surplus ops beyond the authoritative log.
        if self.wal.last_op() > merged.last_op {
            self.wal.truncate_to(merged.last_op)?;
            rewrote = true;
        }

        // Find the first local entry that diverges from the merged
        // suffix and cut there.
        for (op, message) in &merged.suffix {
            if *op > self.wal.last_op() {
                break;
            }
            let local = self
                .wal
                .read(*op)?
                .unwrap_or_else(|| unreachable!("op below last_op present in log"));
            if local != *message {
                tracing::warn!(
                    op = %op,
                    "local uncommitted entry diverges from merged log, truncating"
                );
                self.wal.truncate_to(OpNumber::new(op.as_u64() - 1))?;
                rewrote = true;
                break;
            }
        }

        // Append what we lack. Entries below the merged commit point
        // are not carried; a quorum holds them durably, and a replica
        // that is missing them cannot serve this view change (it could
        // not have voted with a shorter log than its commit number).
        for (op, message) in &merged.suffix {
            let expected = self.wal.last_op().next();
            if *op < expected {
                continue;
            }
            if *op > expected {
                tracing::error!(
                    expected = %expected,
                    got = %op,
                    "gap between local log and merged suffix"
                );
                break;
            }
            self.wal.append(*op, message)?;
            rewrote = true;
        }

        if rewrote {
            self.rebuild_rooms()?;
        }

        let mut output = Output::empty();
        output.committed = self.advance_commit(merged.commit_num)?;
        Ok(output)
    }
}
