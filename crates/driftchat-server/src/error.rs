//! Server error types.

use std::net::SocketAddr;

use driftchat_vsr::ReplicaError;
use driftchat_wire::WireError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors from the server layer.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The connection pool is at its hard bound.
    #[error("too many connections (limit {limit})")]
    TooManyConnections { limit: usize },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}
