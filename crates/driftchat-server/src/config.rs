//! Node configuration.
//!
//! Loaded from a toml file at startup and validated fail-fast: a
//! misconfigured replica refuses to start rather than joining the
//! cluster with bad identity or timing parameters.
//!
//! ```toml
//! cluster_id = "000000000000000000000000deadbeef"
//! replica_id = 0
//! bind_host = "127.0.0.1"
//! bind_port = 7401
//! data_dir = "/var/lib/driftchat"
//! secret_key = "<64 hex chars>"
//!
//! [[peers]]
//! replica_id = 1
//! host = "127.0.0.1"
//! port = 7402
//! public_key = "<64 hex chars>"
//!
//! [[peers]]
//! replica_id = 2
//! host = "127.0.0.1"
//! port = 7403
//! public_key = "<64 hex chars>"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use driftchat_crypto::{PublicKey, SecretKey};
use driftchat_types::{ClusterId, ReplicaId, CLUSTER_SIZE, MAX_WAL_ENTRIES};
use serde::Deserialize;
use thiserror::Error;

use crate::bounded_queue::MAX_QUEUE_CAPACITY;

/// Configuration errors; every one aborts startup with a descriptive
/// message and a non-zero exit.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("replica_id {0} must be 0, 1, or 2")]
    ReplicaIdRange(u8),

    #[error("bind_port {0} must be above 1024")]
    PrivilegedPort(u16),

    #[error("expected exactly {expected} peers, found {found}")]
    PeerCount { expected: usize, found: usize },

    #[error("peer replica ids must be distinct and differ from ours")]
    PeerIds,

    #[error("prepare_timeout_ms must be positive")]
    ZeroPrepareTimeout,

    #[error("view_change_timeout_ms ({view_change}) must exceed prepare_timeout_ms ({prepare})")]
    TimeoutOrdering { prepare: u64, view_change: u64 },

    #[error("queue_capacity {0} must be in (0, 1000000]")]
    QueueCapacity(usize),

    #[error("wal_max_entries {0} must be in (0, 10000000]")]
    WalCapacity(u64),

    #[error("{field} must be {expected} hex characters")]
    HexLength {
        field: &'static str,
        expected: usize,
    },

    #[error("{field} contains a non-hex character")]
    HexDigit { field: &'static str },

    #[error("secret_key must not be all zeros")]
    ZeroSecret,

    #[error("public_key for replica {0} is not a valid Ed25519 point")]
    BadPublicKey(u8),

    #[error("invalid {field} address: {source}")]
    BadAddress {
        field: &'static str,
        source: std::net::AddrParseError,
    },
}

/// One peer replica's location and identity.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub replica_id: u8,
    pub host: String,
    pub port: u16,
    /// 32-byte Ed25519 public key, hex.
    pub public_key: String,
}

/// The full node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// 128-bit cluster id, hex (up to 32 characters).
    pub cluster_id: String,
    pub replica_id: u8,
    pub bind_host: String,
    pub bind_port: u16,
    pub data_dir: PathBuf,
    /// 32-byte Ed25519 signing seed, hex.
    pub secret_key: String,
    pub peers: Vec<PeerConfig>,

    #[serde(default = "default_prepare_timeout_ms")]
    pub prepare_timeout_ms: u64,
    #[serde(default = "default_view_change_timeout_ms")]
    pub view_change_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_wal_max_entries")]
    pub wal_max_entries: u64,
}

fn default_prepare_timeout_ms() -> u64 {
    50
}

fn default_view_change_timeout_ms() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_wal_max_entries() -> u64 {
    1_000_000
}

impl NodeConfig {
    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a config from a toml string and validates it.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast validation of every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replica_id >= CLUSTER_SIZE {
            return Err(ConfigError::ReplicaIdRange(self.replica_id));
        }
        if self.bind_port <= 1024 {
            return Err(ConfigError::PrivilegedPort(self.bind_port));
        }
        if self.peers.len() != (CLUSTER_SIZE - 1) as usize {
            return Err(ConfigError::PeerCount {
                expected: (CLUSTER_SIZE - 1) as usize,
                found: self.peers.len(),
            });
        }
        let mut ids: Vec<u8> = self.peers.iter().map(|p| p.replica_id).collect();
        ids.push(self.replica_id);
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != CLUSTER_SIZE as usize || ids.iter().any(|&id| id >= CLUSTER_SIZE) {
            return Err(ConfigError::PeerIds);
        }
        if self.prepare_timeout_ms == 0 {
            return Err(ConfigError::ZeroPrepareTimeout);
        }
        if self.view_change_timeout_ms <= self.prepare_timeout_ms {
            return Err(ConfigError::TimeoutOrdering {
                prepare: self.prepare_timeout_ms,
                view_change: self.view_change_timeout_ms,
            });
        }
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::QueueCapacity(self.queue_capacity));
        }
        if self.wal_max_entries == 0 || self.wal_max_entries > MAX_WAL_ENTRIES {
            return Err(ConfigError::WalCapacity(self.wal_max_entries));
        }

        // Key material parses or the node does not start.
        self.parsed_cluster_id()?;
        self.parsed_secret_key()?;
        self.peer_public_keys()?;
        self.bind_addr()?;
        for peer in &self.peers {
            peer_addr(peer)?;
        }
        Ok(())
    }

    pub fn parsed_cluster_id(&self) -> Result<ClusterId, ConfigError> {
        if self.cluster_id.is_empty() || self.cluster_id.len() > 32 {
            return Err(ConfigError::HexLength {
                field: "cluster_id",
                expected: 32,
            });
        }
        let mut value: u128 = 0;
        for ch in self.cluster_id.chars() {
            let digit = ch.to_digit(16).ok_or(ConfigError::HexDigit {
                field: "cluster_id",
            })? as u128;
            value = (value << 4) | digit;
        }
        Ok(ClusterId::new(value))
    }

    pub fn parsed_replica_id(&self) -> ReplicaId {
        ReplicaId::new(self.replica_id)
    }

    pub fn parsed_secret_key(&self) -> Result<SecretKey, ConfigError> {
        let seed = decode_hex_32(&self.secret_key, "secret_key")?;
        if seed == [0u8; 32] {
            return Err(ConfigError::ZeroSecret);
        }
        Ok(SecretKey::from_seed(&seed))
    }

    /// Public keys for all three replicas, indexed by replica id; this
    /// replica's is derived from its secret.
    pub fn peer_public_keys(&self) -> Result<[PublicKey; CLUSTER_SIZE as usize], ConfigError> {
        let own = self.parsed_secret_key()?.public_key();
        let mut keys: [Option<PublicKey>; CLUSTER_SIZE as usize] = [None, None, None];
        keys[self.replica_id as usize] = Some(own);

        for peer in &self.peers {
            let bytes = decode_hex_32(&peer.public_key, "public_key")?;
            let key = PublicKey::from_bytes(&bytes)
                .ok_or(ConfigError::BadPublicKey(peer.replica_id))?;
            keys[peer.replica_id as usize] = Some(key);
        }

        Ok(keys.map(|k| k.expect("peer id coverage checked in validate")))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_host, self.bind_port)
            .parse()
            .map_err(|source| ConfigError::BadAddress {
                field: "bind",
                source,
            })
    }

    pub fn prepare_timeout_us(&self) -> u64 {
        self.prepare_timeout_ms * 1_000
    }

    pub fn view_change_timeout_us(&self) -> u64 {
        self.view_change_timeout_ms * 1_000
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("replica-{}.wal", self.replica_id))
    }
}

/// Socket address of a peer.
pub fn peer_addr(peer: &PeerConfig) -> Result<SocketAddr, ConfigError> {
    format!("{}:{}", peer.host, peer.port)
        .parse()
        .map_err(|source| ConfigError::BadAddress {
            field: "peer",
            source,
        })
}

fn decode_hex_32(text: &str, field: &'static str) -> Result<[u8; 32], ConfigError> {
    if text.len() != 64 {
        return Err(ConfigError::HexLength {
            field,
            expected: 64,
        });
    }
    let mut out = [0u8; 32];
    let bytes = text.as_bytes();
    for (i, slot) in out.iter_mut().enumerate() {
        let hi = (bytes[2 * i] as char)
            .to_digit(16)
            .ok_or(ConfigError::HexDigit { field })?;
        let lo = (bytes[2 * i + 1] as char)
            .to_digit(16)
            .ok_or(ConfigError::HexDigit { field })?;
        *slot = ((hi << 4) | lo) as u8;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_key(fill: u8) -> String {
        // A valid-looking seed: nonzero, 64 hex chars.
        let mut seed = [0u8; 32];
        seed[0] = fill;
        seed[1] = 0x5A;
        seed.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn peer_public(fill: u8) -> String {
        let mut seed = [0u8; 32];
        seed[0] = fill;
        seed[1] = 0x5A;
        let (_, public) = driftchat_crypto::keypair_from_seed(&seed);
        public
            .to_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    fn valid_toml() -> String {
        format!(
            r#"
cluster_id = "deadbeef"
replica_id = 0
bind_host = "127.0.0.1"
bind_port = 7401
data_dir = "/tmp/driftchat"
secret_key = "{secret}"

[[peers]]
replica_id = 1
host = "127.0.0.1"
port = 7402
public_key = "{peer1}"

[[peers]]
replica_id = 2
host = "127.0.0.1"
port = 7403
public_key = "{peer2}"
"#,
            secret = hex_key(1),
            peer1 = peer_public(2),
            peer2 = peer_public(3),
        )
    }

    #[test]
    fn valid_config_parses() {
        let config = NodeConfig::from_toml(&valid_toml()).expect("valid");
        assert_eq!(config.parsed_cluster_id().unwrap().as_u128(), 0xDEAD_BEEF);
        assert_eq!(config.prepare_timeout_ms, 50);
        assert_eq!(config.view_change_timeout_ms, 300);
        assert_eq!(config.queue_capacity, 4096);
        assert_eq!(
            config.wal_path(),
            PathBuf::from("/tmp/driftchat/replica-0.wal")
        );
        config.peer_public_keys().expect("keys parse");
    }

    #[test]
    fn privileged_port_rejected() {
        let toml = valid_toml().replace("bind_port = 7401", "bind_port = 80");
        assert!(matches!(
            NodeConfig::from_toml(&toml).unwrap_err(),
            ConfigError::PrivilegedPort(80)
        ));
    }

    #[test]
    fn replica_id_range_enforced() {
        let toml = valid_toml().replace("replica_id = 0\n", "replica_id = 3\n");
        assert!(matches!(
            NodeConfig::from_toml(&toml).unwrap_err(),
            ConfigError::ReplicaIdRange(3)
        ));
    }

    #[test]
    fn duplicate_peer_ids_rejected() {
        let toml = valid_toml().replacen("replica_id = 2", "replica_id = 1", 1);
        assert!(matches!(
            NodeConfig::from_toml(&toml).unwrap_err(),
            ConfigError::PeerIds
        ));
    }

    #[test]
    fn timeout_ordering_enforced() {
        // Top-level keys must precede the [[peers]] tables.
        let toml = valid_toml().replace(
            "data_dir = \"/tmp/driftchat\"",
            "data_dir = \"/tmp/driftchat\"\nprepare_timeout_ms = 300",
        );
        assert!(matches!(
            NodeConfig::from_toml(&toml).unwrap_err(),
            ConfigError::TimeoutOrdering { .. }
        ));
    }

    #[test]
    fn queue_capacity_bounds() {
        let toml = valid_toml().replace(
            "data_dir = \"/tmp/driftchat\"",
            "data_dir = \"/tmp/driftchat\"\nqueue_capacity = 0",
        );
        assert!(matches!(
            NodeConfig::from_toml(&toml).unwrap_err(),
            ConfigError::QueueCapacity(0)
        ));
    }

    #[test]
    fn bad_hex_rejected() {
        let toml = valid_toml().replace(&hex_key(1), &"zz".repeat(32));
        assert!(matches!(
            NodeConfig::from_toml(&toml).unwrap_err(),
            ConfigError::HexDigit { .. }
        ));
    }

    #[test]
    fn short_secret_rejected() {
        let toml = valid_toml().replace(&hex_key(1), "abcd");
        assert!(matches!(
            NodeConfig::from_toml(&toml).unwrap_err(),
            ConfigError::HexLength { .. }
        ));
    }
}
