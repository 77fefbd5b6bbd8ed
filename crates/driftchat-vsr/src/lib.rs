//! # driftchat-vsr: the replication engine
//!
//! Viewstamped Replication over a fixed three-replica cluster, one
//! consensus group per room shard.
//!
//! # Protocol Overview
//!
//! ## Normal Operation
//!
//! ```text
//! Client ──submit──► Primary
//!                      │  WAL append + fsync, local apply
//!                      ├──Prepare──► Backup₁
//!                      ├──Prepare──► Backup₂
//!                      │               │ WAL append + fsync, apply
//!                      │◄──PrepareOk───┤
//!                      │  (quorum = self + 1)
//!                      ├──Commit────► All
//! Client ◄──reply────┘
//! ```
//!
//! ## View Change
//!
//! ```text
//! Backup ──StartViewChange──► All      (on prepare timeout)
//!            │ (quorum of votes)
//! Backup ──DoViewChange(log state)──► Primary of new view
//!            │ (quorum of log states, merged by max (last_op, commit))
//! New Primary ──StartView(merged)──► All
//! ```
//!
//! The replica is driven entirely from outside: the server feeds it
//! verified wall-clock timestamps, received envelopes, and periodic
//! ticks, and sends whatever envelopes it emits. Nothing in here reads
//! the clock, polls a socket, or spawns a thread.

pub mod config;
pub mod instrumentation;
pub mod message;
mod replica;
mod tracker;


pub use config::{ClusterConfig, ConfigError};
pub use message::{LogSummary, MAX_VIEW_CHANGE_ENTRIES};
pub use replica::{
    AuditRecord, CommitSink, Committed, Outbound, Output, Replica, ReplicaError, Status,
    SubmitReply, SubmitRequest, MAX_INFLIGHT_PREPARES,
};
pub use tracker::{PrepareTracker, TimeoutTracker};
