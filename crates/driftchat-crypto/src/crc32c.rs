//! CRC-32C (Castagnoli) checksum implementation.
//!
//! Table-driven CRC-32C using the Castagnoli polynomial (reversed
//! `0x82F63B78`). Used for integrity checking of WAL entries, chat
//! message records, and wire envelopes.
//!
//! ## Usage
//!
//! ```
//! use driftchat_crypto::crc32c;
//!
//! // One-shot calculation
//! let checksum = crc32c(b"hello world");
//!
//! // Incremental calculation for split buffers
//! let mut hasher = driftchat_crypto::Crc32c::new();
//! hasher.update(b"hello ");
//! hasher.update(b"world");
//! let checksum = hasher.finalize();
//! ```

/// Castagnoli CRC-32C polynomial (reversed): 0x82F63B78
const POLYNOMIAL: u32 = 0x82F6_3B78;

/// Precomputed lookup table (256 entries), generated at compile time.
const CRC32C_TABLE: [u32; 256] = generate_table();

const fn generate_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the CRC-32C checksum of the given data in one shot.
pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF; // Initial value
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    crc ^ 0xFFFF_FFFF // Final complement
}

/// Incremental CRC-32C hasher for data that arrives in pieces
/// (e.g. header and body of an envelope).
#[derive(Debug, Clone)]
pub struct Crc32c {
    state: u32,
}

impl Crc32c {
    #[must_use]
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Updates the checksum state with the given data.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = ((self.state ^ u32::from(byte)) & 0xFF) as usize;
            self.state = (self.state >> 8) ^ CRC32C_TABLE[index];
        }
    }

    /// Finalizes the computation and returns the checksum.
    ///
    /// Consumes the hasher to prevent reuse after finalization.
    #[must_use]
    pub fn finalize(self) -> u32 {
        self.state ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_empty() {
        assert_eq!(crc32c(b""), 0x0000_0000);
    }

    #[test]
    fn crc32c_known_vectors() {
        // "123456789" - standard CRC check value for Castagnoli
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);

        assert_eq!(crc32c(b"abc"), 0x364B_3FB7);

        // 32 zero bytes - iSCSI test vector (RFC 3720 B.4)
        assert_eq!(crc32c(&[0u8; 32]), 0x8A91_36AA);

        assert_eq!(crc32c(b"a"), 0xC1D0_4330);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let data = b"The quick brown fox jumps over the lazy dog";

        let mut hasher = Crc32c::new();
        hasher.update(data);
        assert_eq!(hasher.finalize(), crc32c(data));
    }

    #[test]
    fn chunking_invariant() {
        let data = b"The quick brown fox jumps over the lazy dog";

        for split in 0..data.len() {
            let mut hasher = Crc32c::new();
            hasher.update(&data[..split]);
            hasher.update(&data[split..]);
            assert_eq!(hasher.finalize(), crc32c(data));
        }
    }

    #[test]
    fn single_bit_flip_changes_checksum() {
        let mut data = *b"hello world";
        let original = crc32c(&data);
        data[3] ^= 0x01;
        assert_ne!(crc32c(&data), original);
    }

    #[cfg(feature = "proptest")]
    #[test]
    fn proptest_incremental_matches_oneshot() {
        use proptest::prelude::*;

        proptest!(|(data: Vec<u8>, split: usize)| {
            if data.is_empty() {
                return Ok(());
            }
            let split = split % data.len();
            let mut hasher = Crc32c::new();
            hasher.update(&data[..split]);
            hasher.update(&data[split..]);
            prop_assert_eq!(hasher.finalize(), crc32c(&data));
        });
    }
}
