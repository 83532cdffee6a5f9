//! Deterministic Random Number Generator
//!
//! Xorshift128+ seeded from an opaque seed string.
//! Given the same seed string, produces the identical sequence on all platforms,
//! which lets a race be simulated once and replayed verbatim to both players.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Domain separator for seed string hashing.
const SEED_DOMAIN: &[u8] = b"DUEL_RACE_SEED_V1";

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Determinism Guarantee
///
/// Given the same seed, this RNG will produce the exact same sequence
/// of random numbers on any platform. Floats are derived from integer
/// output with exact IEEE-754 operations only.
///
/// # Example
///
/// ```
/// use duel_race::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::from_seed_str("race_1000_5_7");
/// let mut b = DeterministicRng::from_seed_str("race_1000_5_7");
/// assert_eq!(a.next_float(0.0, 100.0), b.next_float(0.0, 100.0));
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl DeterministicRng {
    /// Create an RNG from a 64-bit seed, expanded with SplitMix64.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state = [splitmix64(&mut s), splitmix64(&mut s)];

        // Xorshift never leaves the all-zero state.
        if state == [0, 0] {
            return Self { state: [1, 1] };
        }
        Self { state }
    }

    /// Create an RNG from an opaque seed string.
    pub fn from_seed_str(seed: &str) -> Self {
        Self::new(seed_from_str(seed))
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a float uniformly in [0, 1).
    ///
    /// Uses the upper 53 bits, the full mantissa precision of an f64.
    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Generate a float in range [min, max).
    #[inline]
    pub fn next_float(&mut self, min: f64, max: f64) -> f64 {
        if min >= max {
            return min;
        }
        min + self.next_f64() * (max - min)
    }

    /// Generate an integer in range [min, max] (inclusive).
    #[inline]
    pub fn next_int(&mut self, min: i64, max: i64) -> i64 {
        if min >= max {
            return min;
        }
        // Zero span means the full i64 range. Modulo bias is negligible for
        // the small ranges used here.
        let span = max.abs_diff(min).wrapping_add(1);
        let offset = match span {
            0 => self.next_u64(),
            n => self.next_u64() % n,
        };
        min.wrapping_add(offset as i64)
    }

    /// Select a random element from a slice.
    pub fn pick_one<'a, T>(&mut self, slice: &'a [T]) -> Option<&'a T> {
        let last = slice.len().checked_sub(1)?;
        slice.get(self.next_int(0, last as i64) as usize)
    }
}

/// SplitMix64 step.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Reduce a seed string to a 64-bit seed.
pub fn seed_from_str(seed: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(SEED_DOMAIN);
    hasher.update(seed.as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(bytes)
}

/// Build the seed string for a race between two contestants.
///
/// Format: `race_{created_at_ms}_{first}_{second}`, with contestants in
/// participant order.
pub fn race_seed(created_at_ms: i64, first: u64, second: u64) -> String {
    format!("race_{}_{}_{}", created_at_ms, first, second)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_determinism() {
        // Same seed must produce same sequence
        let mut rng1 = DeterministicRng::from_seed_str("race_1000_5_7");
        let mut rng2 = DeterministicRng::from_seed_str("race_1000_5_7");

        for _ in 0..1000 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_different_seeds() {
        let mut rng1 = DeterministicRng::from_seed_str("race_1000_5_7");
        let mut rng2 = DeterministicRng::from_seed_str("race_1000_7_5");

        // Very unlikely to match
        assert_ne!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn test_seed_from_str_stable() {
        assert_eq!(seed_from_str("abc"), seed_from_str("abc"));
        assert_ne!(seed_from_str("abc"), seed_from_str("abd"));
    }

    #[test]
    fn test_next_f64_range() {
        let mut rng = DeterministicRng::new(1234);
        for _ in 0..10_000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_next_float_range() {
        let mut rng = DeterministicRng::new(9999);

        for _ in 0..1000 {
            let val = rng.next_float(1.1, 1.3);
            assert!(val >= 1.1 && val < 1.3);
        }

        // Edge case: empty range
        assert_eq!(rng.next_float(5.0, 5.0), 5.0);
    }

    #[test]
    fn test_next_int_range() {
        let mut rng = DeterministicRng::new(5678);

        for _ in 0..1000 {
            let val = rng.next_int(-10, 10);
            assert!((-10..=10).contains(&val));
        }

        // Edge case: min = max
        assert_eq!(rng.next_int(5, 5), 5);
    }

    #[test]
    fn test_pick_one() {
        let mut rng = DeterministicRng::new(42);
        let items = ["speed", "agility", "endurance", "luck"];

        for _ in 0..100 {
            let picked = rng.pick_one(&items).unwrap();
            assert!(items.contains(picked));
        }

        let empty: [u8; 0] = [];
        assert!(rng.pick_one(&empty).is_none());
    }

    #[test]
    fn test_race_seed_format() {
        assert_eq!(race_seed(1000, 5, 7), "race_1000_5_7");
    }
}
