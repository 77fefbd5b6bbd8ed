//! # driftchat-server: the replica process
//!
//! Everything between the replication engine and the operating system:
//! a single-threaded `mio` event loop over non-blocking sockets, framed
//! envelope links to the two peer replicas, a bounded ingress queue,
//! toml configuration with fail-fast validation, and signal-driven
//! shutdown.

pub mod bounded_queue;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;

pub use bounded_queue::{BoundedQueue, PushResult};
pub use config::{NodeConfig, PeerConfig};
pub use error::{ServerError, ServerResult};
pub use server::Server;
