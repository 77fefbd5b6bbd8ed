//! # driftchat-crypto: checksum, hash, signature, and PRNG primitives
//!
//! Everything the consensus core needs from cryptography, in one place:
//!
//! - [`crc32c`]: CRC-32C (Castagnoli) for storage and wire integrity
//! - [`sha256`]: SHA-256 for the per-room hash chain
//! - [`ed25519`]: message signing between replicas
//! - [`prng`]: a seeded xorshift64* generator for deterministic tests
//!
//! All functions take borrowed byte slices and allocate nothing on the
//! hot path.

pub mod crc32c;
pub mod ed25519;
pub mod prng;
pub mod sha256;

pub use crc32c::{crc32c, Crc32c};
pub use ed25519::{keypair_from_seed, sign, verify, PublicKey, SecretKey, Signature};
pub use prng::Prng;
pub use sha256::sha256;
