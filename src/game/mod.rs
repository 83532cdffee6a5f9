//! Game Logic Module
//!
//! Race simulation code. 100% deterministic, no I/O.
//!
//! ## Module Structure
//!
//! - `contestant`: Contestant identity and stat profile
//! - `race`: Frame-by-frame race simulator

pub mod contestant;
pub mod race;

// Re-export key types
pub use contestant::{Contestant, ContestantId, ContestantSummary};
pub use race::{simulate, Frame, FinalPosition, RaceConfig, RacerFrame, SimulationError, SimulationResult};
