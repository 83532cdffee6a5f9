//! Core deterministic primitives.
//!
//! Everything a race needs to be reproducible: the seeded RNG, stat
//! scoring, and result hashing.

pub mod rng;
pub mod stats;
pub mod hash;

// Re-export core types
pub use rng::{DeterministicRng, race_seed};
pub use stats::{StatVector, StatError};
pub use hash::{ResultHasher, ResultHash};
