//! Race Simulation
//!
//! Pure function from two contestants and a seed to the complete race:
//! every frame, the winner, and final positions. The race is computed once,
//! up front, and the frames are replayed to both players afterwards.
//!
//! # Determinism
//!
//! - All randomness comes from a [`DeterministicRng`] built from the seed string
//! - Contestants are processed in participant order every step
//! - Luck rolls are drawn in a fixed order (boost check, then penalty check)
//! - Only exact IEEE-754 arithmetic (`+ - * /`, `max`, `min`)

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::hash::{ResultHash, ResultHasher};
use crate::core::rng::DeterministicRng;
use crate::core::stats::StatError;
use crate::game::contestant::{Contestant, ContestantId};
use crate::{RACE_DISTANCE, RACE_DURATION_STEPS};

/// Starting stamina for every contestant.
pub const INITIAL_STAMINA: f64 = 100.0;

/// Boost multiplier range when the luck roll hits.
const BOOST_RANGE: (f64, f64) = (1.1, 1.3);

/// Penalty multiplier range when the unlucky roll hits.
const PENALTY_RANGE: (f64, f64) = (0.8, 0.95);

/// Configuration for a race.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RaceConfig {
    /// Distance to the finish line.
    pub distance: f64,
    /// Number of one-unit steps after step zero before the race is called.
    pub duration_steps: u32,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            distance: RACE_DISTANCE,
            duration_steps: RACE_DURATION_STEPS,
        }
    }
}

/// One contestant's state within a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RacerFrame {
    /// Contestant identifier.
    pub contestant_id: ContestantId,
    /// Distance covered, capped at the race distance.
    pub position: f64,
    /// Velocity applied this step.
    pub velocity: f64,
    /// Remaining stamina (0-100).
    pub stamina: f64,
}

/// Snapshot of both contestants after one time step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Step index, strictly increasing from zero.
    pub time_index: u32,
    /// Per-contestant state, in participant order.
    pub positions: [RacerFrame; 2],
}

/// Where a contestant ended up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalPosition {
    /// Contestant identifier.
    pub contestant_id: ContestantId,
    /// Display name.
    pub name: String,
    /// Final position, capped at the race distance.
    pub position: f64,
    /// Whether the finish line was reached.
    pub finished: bool,
}

/// Complete outcome of a simulated race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Winning contestant (always one of the two participants).
    pub winner_id: ContestantId,
    /// Last step index simulated.
    pub elapsed_time: u32,
    /// Every frame, in time order. Never empty.
    pub frames: Vec<Frame>,
    /// Final positions in participant order.
    pub final_positions: [FinalPosition; 2],
}

impl SimulationResult {
    /// Fingerprint of the whole result, for cross-checking replays.
    pub fn fingerprint(&self) -> ResultHash {
        let mut hasher = ResultHasher::for_race_result();
        hasher.update_u64(self.winner_id.get());
        hasher.update_u32(self.elapsed_time);
        hasher.update_u32(self.frames.len() as u32);
        for frame in &self.frames {
            hasher.update_u32(frame.time_index);
            for racer in &frame.positions {
                hasher.update_u64(racer.contestant_id.get());
                hasher.update_f64(racer.position);
                hasher.update_f64(racer.velocity);
                hasher.update_f64(racer.stamina);
            }
        }
        for fp in &self.final_positions {
            hasher.update_u64(fp.contestant_id.get());
            hasher.update_str(&fp.name);
            hasher.update_f64(fp.position);
            hasher.update_bool(fp.finished);
        }
        hasher.finalize()
    }

    /// The contestant that did not win.
    pub fn loser_id(&self) -> ContestantId {
        if self.final_positions[0].contestant_id == self.winner_id {
            self.final_positions[1].contestant_id
        } else {
            self.final_positions[0].contestant_id
        }
    }
}

/// Simulation errors. These indicate a caller bug: inputs should be
/// validated before a match is ever created.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    /// A contestant's stat vector is malformed.
    #[error("contestant {contestant} has invalid stats: {source}")]
    InvalidStats {
        /// Offending contestant.
        contestant: ContestantId,
        /// Underlying stat error.
        source: StatError,
    },

    /// Both sides are the same contestant.
    #[error("contestant {0} cannot race itself")]
    SameContestant(ContestantId),

    /// Race configuration is unusable.
    #[error("invalid race distance {0}")]
    InvalidDistance(f64),
}

/// Mutable per-contestant state during simulation.
struct RacerState {
    id: ContestantId,
    speed: f64,
    agility: f64,
    endurance: f64,
    luck: f64,
    position: f64,
    velocity: f64,
    stamina: f64,
}

impl RacerState {
    fn new(contestant: &Contestant) -> Self {
        let stats = contestant.stats;
        Self {
            id: contestant.id,
            speed: stats.speed as f64,
            agility: stats.agility as f64,
            endurance: stats.endurance as f64,
            luck: stats.luck as f64,
            position: 0.0,
            velocity: 0.0,
            stamina: INITIAL_STAMINA,
        }
    }

    /// Advance one time step. Returns true if the finish line was crossed.
    fn step(&mut self, rng: &mut DeterministicRng, distance: f64) -> bool {
        self.velocity = (self.speed * 0.4 + self.agility * 0.2) * (self.stamina / 100.0);

        if rng.next_float(0.0, 100.0) < self.luck {
            self.velocity *= rng.next_float(BOOST_RANGE.0, BOOST_RANGE.1);
        } else if rng.next_float(0.0, 100.0) < 10.0 - self.luck / 10.0 {
            self.velocity *= rng.next_float(PENALTY_RANGE.0, PENALTY_RANGE.1);
        }

        self.position += self.velocity;
        self.stamina = (self.stamina - (100.0 - self.endurance) * 0.1).max(0.0);

        if self.position >= distance {
            self.position = distance;
            true
        } else {
            false
        }
    }

    fn snapshot(&self) -> RacerFrame {
        RacerFrame {
            contestant_id: self.id,
            position: self.position,
            velocity: self.velocity,
            stamina: self.stamina,
        }
    }
}

/// Simulate a race between two contestants.
///
/// Steps `0..=duration_steps` are simulated, one frame each, stopping after
/// the step in which the first contestant crosses the finish line. If nobody
/// finishes, the contestant further ahead wins; on an exact tie the first
/// listed contestant wins.
pub fn simulate(
    first: &Contestant,
    second: &Contestant,
    seed: &str,
    config: &RaceConfig,
) -> Result<SimulationResult, SimulationError> {
    for contestant in [first, second] {
        contestant
            .stats
            .validate()
            .map_err(|source| SimulationError::InvalidStats {
                contestant: contestant.id,
                source,
            })?;
    }
    if first.id == second.id {
        return Err(SimulationError::SameContestant(first.id));
    }
    if !(config.distance.is_finite() && config.distance > 0.0) {
        return Err(SimulationError::InvalidDistance(config.distance));
    }

    let mut rng = DeterministicRng::from_seed_str(seed);
    let mut racers = [RacerState::new(first), RacerState::new(second)];
    let mut frames = Vec::with_capacity(config.duration_steps as usize + 1);
    let mut winner: Option<ContestantId> = None;
    let mut elapsed_time = 0;

    for time_index in 0..=config.duration_steps {
        elapsed_time = time_index;

        for racer in racers.iter_mut() {
            if racer.position >= config.distance {
                continue;
            }
            if racer.step(&mut rng, config.distance) && winner.is_none() {
                winner = Some(racer.id);
            }
        }

        frames.push(Frame {
            time_index,
            positions: [racers[0].snapshot(), racers[1].snapshot()],
        });

        if winner.is_some() {
            break;
        }
    }

    let winner_id = winner.unwrap_or_else(|| decide_winner(&racers));

    let final_positions = [
        final_position(&racers[0], first, config.distance),
        final_position(&racers[1], second, config.distance),
    ];

    Ok(SimulationResult {
        winner_id,
        elapsed_time,
        frames,
        final_positions,
    })
}

/// Winner when nobody reached the line: furthest ahead, first listed on an
/// exact tie.
fn decide_winner(racers: &[RacerState; 2]) -> ContestantId {
    if racers[1].position > racers[0].position {
        racers[1].id
    } else {
        racers[0].id
    }
}

fn final_position(racer: &RacerState, contestant: &Contestant, distance: f64) -> FinalPosition {
    FinalPosition {
        contestant_id: racer.id,
        name: contestant.name.clone(),
        position: racer.position,
        finished: racer.position >= distance,
    }
}

// =============================================================================
// TESTS
// =============================================================================
