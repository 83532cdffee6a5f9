//! Match Session Management
//!
//! Authoritative store of active matches: participants, status, the
//! precomputed race, and the playback cursor. Also answers "which match is
//! this contestant in" through a secondary index.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::rng::race_seed;
use crate::game::contestant::{Contestant, ContestantId};
use crate::game::race::{Frame, SimulationResult};
use crate::network::auth::UserId;

/// Identifier of one live connection.
pub type ConnectionId = u64;

/// Unique match identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(pub Uuid);

impl MatchId {
    /// Generate a fresh random id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Match status. Strictly forward: Waiting → Countdown → Racing → Finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Paired, countdown not started.
    Waiting,
    /// Counting down to the start.
    Countdown,
    /// Frames are being replayed.
    Racing,
    /// Terminal.
    Finished,
}

impl MatchStatus {
    /// Whether moving to `next` goes forward.
    ///
    /// Steps may be skipped (a forfeit during countdown goes straight to
    /// finished), but never repeated or reversed.
    pub fn can_transition_to(self, next: MatchStatus) -> bool {
        next > self
    }

    /// Countdown or racing.
    pub fn is_live(self) -> bool {
        matches!(self, MatchStatus::Countdown | MatchStatus::Racing)
    }
}

/// How a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// All frames replayed.
    Completed,
    /// A participant disconnected.
    Forfeit,
    /// Torn down without a result.
    Aborted,
}

/// Final outcome of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    /// Winner, if the match was decided.
    pub winner: Option<ContestantId>,
    /// Why the match ended.
    pub reason: EndReason,
}

impl MatchOutcome {
    /// Match decided by the race.
    pub fn completed(winner: ContestantId) -> Self {
        Self { winner: Some(winner), reason: EndReason::Completed }
    }

    /// Match decided by a disconnect.
    pub fn forfeit(winner: ContestantId) -> Self {
        Self { winner: Some(winner), reason: EndReason::Forfeit }
    }

    /// Match torn down undecided.
    pub fn aborted() -> Self {
        Self { winner: None, reason: EndReason::Aborted }
    }
}

/// One side of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Owner of the contestant.
    pub user_id: UserId,
    /// Connection to notify.
    pub connection_id: ConnectionId,
    /// Contestant copy, immutable for the match.
    pub contestant: Contestant,
}

/// A match between two contestants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    /// Unique match identifier.
    pub id: MatchId,
    /// Both sides, in participant order.
    pub participants: [Participant; 2],
    /// Stake each side put up.
    pub wager: u64,
    /// Current status.
    pub status: MatchStatus,
    /// Race seed.
    pub seed: String,
    /// Precomputed race, once simulated.
    pub result: Option<SimulationResult>,
    /// Index of the next frame to replay.
    pub cursor: usize,
    /// Set when finished.
    pub outcome: Option<MatchOutcome>,
    /// When the match was created.
    pub created_at: DateTime<Utc>,
    /// When the match finished.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Match {
    /// Create a waiting match with a seed derived from its creation time.
    pub fn new(participants: [Participant; 2], wager: u64) -> Self {
        let created_at = Utc::now();
        let seed = race_seed(
            created_at.timestamp_millis(),
            participants[0].contestant.id.get(),
            participants[1].contestant.id.get(),
        );
        Self {
            id: MatchId::new_v4(),
            participants,
            wager,
            status: MatchStatus::Waiting,
            seed,
            result: None,
            cursor: 0,
            outcome: None,
            created_at,
            ended_at: None,
        }
    }

    /// Participant for a contestant.
    pub fn participant(&self, contestant: ContestantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.contestant.id == contestant)
    }

    /// The other side from a contestant's point of view.
    pub fn opponent_of(&self, contestant: ContestantId) -> Option<&Participant> {
        match self.participants.iter().position(|p| p.contestant.id == contestant)? {
            0 => Some(&self.participants[1]),
            _ => Some(&self.participants[0]),
        }
    }

    /// Frame under the playback cursor.
    pub fn current_frame(&self) -> Option<&Frame> {
        self.result.as_ref()?.frames.get(self.cursor)
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No such match.
    #[error("match {0} not found")]
    NotFound(MatchId),

    /// Contestant is already in a live match.
    #[error("contestant {0} is already in a match")]
    AlreadyInMatch(ContestantId),

    /// Both participants are the same contestant.
    #[error("contestant {0} cannot be matched against itself")]
    SameContestant(ContestantId),

    /// Transition is not forward.
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current status.
        from: MatchStatus,
        /// Requested status.
        to: MatchStatus,
    },

    /// Result already attached or attached at the wrong time.
    #[error("simulation result cannot be attached in status {0:?}")]
    ResultRejected(MatchStatus),
}

/// Match storage.
///
/// Every mutating method is atomic with respect to others on the same match.
#[async_trait]
pub trait MatchRegistry: Send + Sync {
    /// Create a waiting match and index both participants.
    async fn create(&self, participants: [Participant; 2], wager: u64) -> Result<Match, RegistryError>;

    /// Snapshot of a match.
    async fn get(&self, id: MatchId) -> Option<Match>;

    /// Snapshot of the most recent match a contestant is part of.
    async fn get_by_participant(&self, contestant: ContestantId) -> Option<Match>;

    /// Store the race result. Allowed once, during countdown.
    async fn attach_result(&self, id: MatchId, result: SimulationResult) -> Result<(), RegistryError>;

    /// Frame under the playback cursor.
    async fn current_frame(&self, id: MatchId) -> Option<Frame>;

    /// Move the cursor one frame forward. Returns whether frames remain.
    async fn advance(&self, id: MatchId) -> Result<bool, RegistryError>;

    /// Move to a later status. Returns the previous status.
    async fn transition(&self, id: MatchId, to: MatchStatus) -> Result<MatchStatus, RegistryError>;

    /// Move to `Finished` and record the outcome.
    ///
    /// Fails if the match already finished, so only one caller ever wins.
    async fn finish(&self, id: MatchId, outcome: MatchOutcome) -> Result<Match, RegistryError>;

    /// Remove a match and its index entries.
    async fn destroy(&self, id: MatchId) -> Option<Match>;

    /// Number of stored matches.
    async fn len(&self) -> usize;
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Single-process match registry.
pub struct SessionManager {
    /// Active matches.
    sessions: RwLock<BTreeMap<MatchId, Arc<RwLock<Match>>>>,
    /// Contestant to match mapping.
    participants: RwLock<BTreeMap<ContestantId, MatchId>>,
}

impl SessionManager {
    /// Create new session manager.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            participants: RwLock::new(BTreeMap::new()),
        }
    }

    async fn session(&self, id: MatchId) -> Option<Arc<RwLock<Match>>> {
        self.sessions.read().await.get(&id).cloned()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MatchRegistry for SessionManager {
    async fn create(&self, participants: [Participant; 2], wager: u64) -> Result<Match, RegistryError> {
        let a = participants[0].contestant.id;
        let b = participants[1].contestant.id;
        if a == b {
            return Err(RegistryError::SameContestant(a));
        }

        // Lock order: sessions, then participants, then individual matches.
        let mut sessions = self.sessions.write().await;
        let mut index = self.participants.write().await;

        for contestant in [a, b] {
            if let Some(existing) = index.get(&contestant).and_then(|id| sessions.get(id)) {
                if existing.read().await.status != MatchStatus::Finished {
                    return Err(RegistryError::AlreadyInMatch(contestant));
                }
            }
        }

        let new_match = Match::new(participants, wager);
        index.insert(a, new_match.id);
        index.insert(b, new_match.id);
        sessions.insert(new_match.id, Arc::new(RwLock::new(new_match.clone())));

        info!(match_id = %new_match.id, first = %a, second = %b, wager, "match created");
        Ok(new_match)
    }

    async fn get(&self, id: MatchId) -> Option<Match> {
        let session = self.session(id).await?;
        let guard = session.read().await;
        Some(guard.clone())
    }

    async fn get_by_participant(&self, contestant: ContestantId) -> Option<Match> {
        let id = *self.participants.read().await.get(&contestant)?;
        self.get(id).await
    }

    async fn attach_result(&self, id: MatchId, result: SimulationResult) -> Result<(), RegistryError> {
        let session = self.session(id).await.ok_or(RegistryError::NotFound(id))?;
        let mut m = session.write().await;
        if m.status != MatchStatus::Countdown || m.result.is_some() {
            return Err(RegistryError::ResultRejected(m.status));
        }
        m.result = Some(result);
        m.cursor = 0;
        Ok(())
    }

    async fn current_frame(&self, id: MatchId) -> Option<Frame> {
        let session = self.session(id).await?;
        let m = session.read().await;
        m.current_frame().cloned()
    }

    async fn advance(&self, id: MatchId) -> Result<bool, RegistryError> {
        let session = self.session(id).await.ok_or(RegistryError::NotFound(id))?;
        let mut m = session.write().await;
        let total = m.result.as_ref().map(|r| r.frames.len()).unwrap_or(0);
        if m.cursor < total {
            m.cursor += 1;
        }
        Ok(m.cursor < total)
    }

    async fn transition(&self, id: MatchId, to: MatchStatus) -> Result<MatchStatus, RegistryError> {
        let session = self.session(id).await.ok_or(RegistryError::NotFound(id))?;
        let mut m = session.write().await;
        let from = m.status;
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition { from, to });
        }
        m.status = to;
        if to == MatchStatus::Finished {
            m.ended_at = Some(Utc::now());
        }
        debug!(match_id = %id, ?from, ?to, "match transition");
        Ok(from)
    }

    async fn finish(&self, id: MatchId, outcome: MatchOutcome) -> Result<Match, RegistryError> {
        let session = self.session(id).await.ok_or(RegistryError::NotFound(id))?;
        let mut m = session.write().await;
        let from = m.status;
        if !from.can_transition_to(MatchStatus::Finished) {
            return Err(RegistryError::InvalidTransition { from, to: MatchStatus::Finished });
        }
        m.status = MatchStatus::Finished;
        m.ended_at = Some(Utc::now());
        m.outcome = Some(outcome);
        info!(match_id = %id, ?from, reason = ?outcome.reason, winner = ?outcome.winner, "match finished");
        Ok(m.clone())
    }

    async fn destroy(&self, id: MatchId) -> Option<Match> {
        let mut sessions = self.sessions.write().await;
        let mut index = self.participants.write().await;

        let session = match sessions.remove(&id) {
            Some(s) => s,
            None => {
                warn!(match_id = %id, "destroy of unknown match");
                return None;
            }
        };
        let removed = session.read().await.clone();

        // Leave index entries that already point at a newer match.
        for p in &removed.participants {
            if index.get(&p.contestant.id) == Some(&id) {
                index.remove(&p.contestant.id);
            }
        }

        debug!(match_id = %id, "match destroyed");
        Some(removed)
    }

    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
