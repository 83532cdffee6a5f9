//! Result Hashing for Verification
//!
//! Deterministic hashing of simulation output, so both players and the
//! ledger can confirm they hold the same race.

use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type ResultHash = [u8; 32];

/// Deterministic hasher for simulation results.
///
/// Wraps SHA-256 with helpers for the primitive types a race is made of.
/// Order of updates is critical for determinism.
pub struct ResultHasher {
    hasher: Sha256,
}

impl ResultHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for a race simulation result.
    pub fn for_race_result() -> Self {
        Self::new(b"DUEL_RACE_RESULT_V1")
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with the exact bit pattern of an f64.
    #[inline]
    pub fn update_f64(&mut self, value: f64) {
        self.update_u64(value.to_bits());
    }

    /// Update with a boolean.
    #[inline]
    pub fn update_bool(&mut self, value: bool) {
        self.update_u8(value as u8);
    }

    /// Update with a length-prefixed string.
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ResultHash {
        self.hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hasher_determinism() {
        let make_hash = || {
            let mut hasher = ResultHasher::for_race_result();
            hasher.update_u32(100);
            hasher.update_u64(12345);
            hasher.update_f64(5.5);
            hasher.update_str("Bolt");
            hasher.update_bool(true);
            hasher.finalize()
        };

        assert_eq!(make_hash(), make_hash());
    }

    #[test]
    fn test_hash_order_matters() {
        let hash1 = {
            let mut h = ResultHasher::new(b"test");
            h.update_u32(1);
            h.update_u32(2);
            h.finalize()
        };

        let hash2 = {
            let mut h = ResultHasher::new(b"test");
            h.update_u32(2);
            h.update_u32(1);
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_float_bits_distinguish_signed_zero() {
        let hash = |v: f64| {
            let mut h = ResultHasher::new(b"test");
            h.update_f64(v);
            h.finalize()
        };

        assert_ne!(hash(0.0), hash(-0.0));
    }

    #[test]
    fn test_string_prefix_prevents_collisions() {
        let hash = |a: &str, b: &str| {
            let mut h = ResultHasher::new(b"test");
            h.update_str(a);
            h.update_str(b);
            h.finalize()
        };

        assert_ne!(hash("ab", "c"), hash("a", "bc"));
    }
}
