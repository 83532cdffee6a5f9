//! Contestant Definitions
//!
//! A contestant is a named stat vector entering a race. It is copied into
//! the match at pairing time and never changes while the match runs.

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::stats::StatVector;

// =============================================================================
// CONTESTANT ID
// =============================================================================

/// Unique contestant identifier.
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContestantId(pub u64);

impl ContestantId {
    /// Create from a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContestantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// CONTESTANT
// =============================================================================

/// A contestant as it enters a match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contestant {
    /// Contestant identifier.
    pub id: ContestantId,
    /// Display name.
    pub name: String,
    /// Stat vector.
    pub stats: StatVector,
}

impl Contestant {
    /// Create a contestant.
    pub fn new(id: ContestantId, name: impl Into<String>, stats: StatVector) -> Self {
        Self { id, name: name.into(), stats }
    }

    /// Matchmaking power score.
    pub fn power_score(&self) -> u32 {
        self.stats.power_score()
    }

    /// Public summary shown to the opponent.
    pub fn summary(&self) -> ContestantSummary {
        ContestantSummary {
            id: self.id,
            name: self.name.clone(),
            stats: self.stats,
            power_score: self.power_score(),
        }
    }
}

/// What the other side gets to see about a contestant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContestantSummary {
    /// Contestant identifier.
    pub id: ContestantId,
    /// Display name.
    pub name: String,
    /// Stat vector.
    pub stats: StatVector,
    /// Sum of stats.
    pub power_score: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contestant_id_serializes_as_number() {
        let json = serde_json::to_string(&ContestantId::new(42)).unwrap();
        assert_eq!(json, "42");
        let parsed: ContestantId = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, ContestantId(42));
    }

    #[test]
    fn test_summary_carries_power_score() {
        let c = Contestant::new(ContestantId(5), "Bolt", StatVector::new(30, 20, 30, 20));
        let summary = c.summary();
        assert_eq!(summary.id, ContestantId(5));
        assert_eq!(summary.name, "Bolt");
        assert_eq!(summary.power_score, 100);
    }
}
