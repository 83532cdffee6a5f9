//! # Duel Race Server
//!
//! Real-time head-to-head wager races: two contestants are paired by
//! matchmaking, the race is simulated once from a seed, and the recorded
//! frames are replayed to both clients before the pot is settled.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DUEL RACE SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Deterministic primitives                │
//! │  ├── rng.rs        - Seeded Xorshift128+ PRNG                │
//! │  ├── stats.rs      - Stat vectors, power and variance        │
//! │  └── hash.rs       - Result fingerprints                     │
//! │                                                              │
//! │  game/             - Race logic (deterministic)              │
//! │  ├── contestant.rs - Contestant identity and stats           │
//! │  └── race.rs       - Frame-by-frame simulator                │
//! │                                                              │
//! │  network/          - Realtime flow (non-deterministic)       │
//! │  ├── queue.rs      - Matchmaking queue                       │
//! │  ├── session.rs    - Match registry                          │
//! │  ├── tasks.rs      - Cancellable per-match tasks             │
//! │  ├── orchestrator.rs - Connection state machine              │
//! │  ├── ledger.rs     - Ownership, balances, settlement         │
//! │  ├── auth.rs       - Token verification                      │
//! │  ├── protocol.rs   - Message types                           │
//! │  └── server.rs     - WebSocket server                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `game/` modules are deterministic:
//! - Floating point limited to `+ - * /`, `min`, `max` and `sqrt`
//! - No HashMap (uses BTreeMap for sorted iteration)
//! - No system time dependencies
//! - All randomness from seeded Xorshift128+
//!
//! The same two stat vectors and seed always produce the same frames and
//! the same winner.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use core::stats::StatVector;
pub use game::contestant::{Contestant, ContestantId};
pub use game::race::{simulate, RaceConfig, SimulationResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Distance to the finish line.
pub const RACE_DISTANCE: f64 = 1000.0;

/// Time steps after step zero before a race is called.
pub const RACE_DURATION_STEPS: u32 = 60;
