//! Cluster configuration for the replication engine.

use driftchat_types::{ClusterId, ReplicaId, QUORUM};
use thiserror::Error;

/// Default prepare timeout: a backup that hears nothing from the
/// primary for this long starts a view change.
pub const DEFAULT_PREPARE_TIMEOUT_US: u64 = 50_000;

/// Default view-change budget: the full timeout → elect → install
/// sequence is expected to finish within this window.
pub const DEFAULT_VIEW_CHANGE_TIMEOUT_US: u64 = 300_000;

/// Configuration errors, all fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("prepare timeout must be positive")]
    ZeroPrepareTimeout,

    #[error(
        "view change timeout ({view_change_us}us) must exceed prepare timeout ({prepare_us}us)"
    )]
    TimeoutOrdering {
        prepare_us: u64,
        view_change_us: u64,
    },
}

/// Immutable per-replica cluster configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// 128-bit cluster identity; envelopes from other clusters are
    /// rejected at the transport.
    pub cluster_id: ClusterId,
    /// This replica's index within the cluster.
    pub replica_id: ReplicaId,
    /// Backup-side prepare timeout in microseconds.
    pub prepare_timeout_us: u64,
    /// View-change duration budget in microseconds. Monitored, not
    /// enforced: overruns are logged for alerting.
    pub view_change_timeout_us: u64,
}

impl ClusterConfig {
    pub fn new(cluster_id: ClusterId, replica_id: ReplicaId) -> Self {
        Self {
            cluster_id,
            replica_id,
            prepare_timeout_us: DEFAULT_PREPARE_TIMEOUT_US,
            view_change_timeout_us: DEFAULT_VIEW_CHANGE_TIMEOUT_US,
        }
    }

    pub fn with_timeouts(mut self, prepare_us: u64, view_change_us: u64) -> Self {
        self.prepare_timeout_us = prepare_us;
        self.view_change_timeout_us = view_change_us;
        self
    }

    /// Fail-fast validation, run once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prepare_timeout_us == 0 {
            return Err(ConfigError::ZeroPrepareTimeout);
        }
        if self.view_change_timeout_us <= self.prepare_timeout_us {
            return Err(ConfigError::TimeoutOrdering {
                prepare_us: self.prepare_timeout_us,
                view_change_us: self.view_change_timeout_us,
            });
        }
        Ok(())
    }

    /// Votes needed for any quorum decision.
    pub fn quorum(&self) -> usize {
        QUORUM
    }
}
