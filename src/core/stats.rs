//! Contestant stat vectors.
//!
//! Four stats drive the race: speed, agility, endurance and luck. Stat
//! generation (the 100-point budget, 10-40 per stat) happens outside this
//! server; here the vector is only validated and scored.

use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Mean stat value of the 100-point budget.
pub const STAT_MEAN: f64 = 25.0;

/// Upper bound accepted for a single stat.
pub const STAT_MAX: u32 = 100;

/// A contestant's stat vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatVector {
    /// Base speed.
    pub speed: u32,
    /// Agility, added to speed at a lower weight.
    pub agility: u32,
    /// Endurance, slows stamina drain.
    pub endurance: u32,
    /// Luck, chance in percent of a speed boost.
    pub luck: u32,
}

/// Stat validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatError {
    /// A stat is zero.
    #[error("stat `{0}` must be positive")]
    NonPositive(&'static str),
    /// A stat exceeds the maximum.
    #[error("stat `{field}` is {value}, above the maximum of {STAT_MAX}")]
    OutOfRange {
        /// Offending field.
        field: &'static str,
        /// Offending value.
        value: u32,
    },
}

impl StatVector {
    /// Create a stat vector.
    pub const fn new(speed: u32, agility: u32, endurance: u32, luck: u32) -> Self {
        Self { speed, agility, endurance, luck }
    }

    /// Named fields in canonical order.
    pub fn fields(&self) -> [(&'static str, u32); 4] {
        [
            ("speed", self.speed),
            ("agility", self.agility),
            ("endurance", self.endurance),
            ("luck", self.luck),
        ]
    }

    /// Reject vectors the simulator cannot run.
    pub fn validate(&self) -> Result<(), StatError> {
        for (field, value) in self.fields() {
            if value == 0 {
                return Err(StatError::NonPositive(field));
            }
            if value > STAT_MAX {
                return Err(StatError::OutOfRange { field, value });
            }
        }
        Ok(())
    }

    /// Matchmaking power score: the sum of all stats.
    pub fn power_score(&self) -> u32 {
        self.speed + self.agility + self.endurance + self.luck
    }

    /// Root-mean-square deviation from the stat mean.
    ///
    /// Higher means a more specialized contestant.
    pub fn variance_score(&self) -> f64 {
        let sum_sq: f64 = self
            .fields()
            .iter()
            .map(|(_, v)| {
                let d = *v as f64 - STAT_MEAN;
                d * d
            })
            .sum();
        (sum_sq / 4.0).sqrt()
    }
}
