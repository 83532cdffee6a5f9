//! Matchmaking Queue
//!
//! Waiting list of contestants looking for an opponent. Pairs require an
//! identical wager and a power score gap of at most 15; an entry that has
//! waited long enough is paired with the next-oldest equal-wager entry
//! regardless of power. Entries that wait too long are evicted.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::game::contestant::{Contestant, ContestantId};
use crate::network::auth::UserId;
use crate::network::session::ConnectionId;

/// A contestant waiting for an opponent.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Contestant being entered.
    pub contestant: Contestant,
    /// Owner of the contestant.
    pub user_id: UserId,
    /// Connection that queued the contestant.
    pub connection_id: ConnectionId,
    /// Stake, must match the opponent's exactly.
    pub wager: u64,
    /// Sum of the contestant's stats.
    pub power_score: u32,
    /// When the entry was queued.
    pub joined_at: Instant,
}

impl QueueEntry {
    /// Create an entry queued now.
    pub fn new(
        contestant: Contestant,
        user_id: UserId,
        connection_id: ConnectionId,
        wager: u64,
    ) -> Self {
        let power_score = contestant.power_score();
        Self {
            contestant,
            user_id,
            connection_id,
            wager,
            power_score,
            joined_at: Instant::now(),
        }
    }

    /// Contestant identifier.
    pub fn contestant_id(&self) -> ContestantId {
        self.contestant.id
    }
}

/// Two entries removed from the queue to race each other.
///
/// `first` is the older entry; it becomes the first-listed participant.
#[derive(Debug, Clone)]
pub struct QueuePair {
    /// Older entry.
    pub first: QueueEntry,
    /// Younger entry.
    pub second: QueueEntry,
}

/// Snapshot of one contestant's place in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Contestant identifier.
    pub contestant_id: ContestantId,
    /// Connection that queued the contestant.
    pub connection_id: ConnectionId,
    /// Stake.
    pub wager: u64,
    /// Power score.
    pub power_score: u32,
    /// Time waited so far.
    pub wait: Duration,
    /// Total entries in the queue.
    pub queue_size: usize,
}

/// Pairing thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingRules {
    /// Largest power score gap for a normal pairing.
    pub max_power_gap: u32,
    /// Wait after which the power constraint is dropped.
    pub relax_after: Duration,
    /// Wait after which an entry is evicted.
    pub stale_after: Duration,
}

impl Default for PairingRules {
    fn default() -> Self {
        Self {
            max_power_gap: 15,
            relax_after: Duration::from_secs(10),
            stale_after: Duration::from_secs(5 * 60),
        }
    }
}

/// Queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Contestant already has a queue entry.
    #[error("contestant {0} is already queued")]
    AlreadyQueued(ContestantId),
}

/// Find the next pair to form, as indices into `entries`.
///
/// `entries` must be ordered by `joined_at`, oldest first. Each entry in turn
/// (oldest first) is the anchor: the first younger entry with the same wager
/// and a power gap within the limit is its match. An anchor that has waited
/// past `relax_after` without such a match takes the next-oldest entry with
/// the same wager instead.
pub fn find_pair(entries: &[QueueEntry], now: Instant, rules: &PairingRules) -> Option<(usize, usize)> {
    for (i, anchor) in entries.iter().enumerate() {
        let same_wager = || {
            entries
                .iter()
                .enumerate()
                .skip(i + 1)
                .filter(move |(_, e)| e.wager == anchor.wager)
        };

        if let Some((j, _)) = same_wager()
            .find(|(_, e)| e.power_score.abs_diff(anchor.power_score) <= rules.max_power_gap)
        {
            return Some((i, j));
        }

        if now.saturating_duration_since(anchor.joined_at) >= rules.relax_after {
            if let Some((j, _)) = same_wager().next() {
                return Some((i, j));
            }
        }
    }
    None
}

/// Remove every pair that can currently be formed.
fn take_pairs(entries: &mut Vec<QueueEntry>, now: Instant, rules: &PairingRules) -> Vec<QueuePair> {
    let mut pairs = Vec::new();
    while let Some((i, j)) = find_pair(entries, now, rules) {
        // j > i, remove the later index first
        let second = entries.remove(j);
        let first = entries.remove(i);
        pairs.push(QueuePair { first, second });
    }
    pairs
}

/// Matchmaking queue storage.
///
/// Every method is atomic with respect to the others.
#[async_trait]
pub trait MatchQueue: Send + Sync {
    /// Queue a contestant and return any pairs that became possible.
    async fn join(&self, entry: QueueEntry) -> Result<Vec<QueuePair>, QueueError>;

    /// Remove a contestant's entry.
    async fn leave(&self, contestant: ContestantId) -> Option<QueueEntry>;

    /// Where a contestant stands, if queued.
    async fn status(&self, contestant: ContestantId) -> Option<QueueStatus>;

    /// Form every pair currently possible (periodic sweep).
    async fn pair_waiting(&self) -> Vec<QueuePair>;

    /// Remove and return entries that waited too long.
    async fn evict_stale(&self) -> Vec<QueueEntry>;

    /// Number of waiting entries.
    async fn len(&self) -> usize;
}

/// Single-process queue.
pub struct InMemoryQueue {
    entries: RwLock<Vec<QueueEntry>>,
    rules: PairingRules,
}

impl InMemoryQueue {
    /// Create an empty queue.
    pub fn new(rules: PairingRules) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            rules,
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(PairingRules::default())
    }
}

#[async_trait]
impl MatchQueue for InMemoryQueue {
    async fn join(&self, entry: QueueEntry) -> Result<Vec<QueuePair>, QueueError> {
        let mut entries = self.entries.write().await;

        if entries.iter().any(|e| e.contestant.id == entry.contestant.id) {
            return Err(QueueError::AlreadyQueued(entry.contestant.id));
        }

        debug!(
            contestant = %entry.contestant.id,
            wager = entry.wager,
            power = entry.power_score,
            "queue join"
        );

        let at = entries.partition_point(|e| e.joined_at <= entry.joined_at);
        entries.insert(at, entry);

        Ok(take_pairs(&mut entries, Instant::now(), &self.rules))
    }

    async fn leave(&self, contestant: ContestantId) -> Option<QueueEntry> {
        let mut entries = self.entries.write().await;
        let pos = entries.iter().position(|e| e.contestant.id == contestant)?;
        Some(entries.remove(pos))
    }

    async fn status(&self, contestant: ContestantId) -> Option<QueueStatus> {
        let entries = self.entries.read().await;
        let entry = entries.iter().find(|e| e.contestant.id == contestant)?;
        Some(QueueStatus {
            contestant_id: contestant,
            connection_id: entry.connection_id,
            wager: entry.wager,
            power_score: entry.power_score,
            wait: Instant::now().saturating_duration_since(entry.joined_at),
            queue_size: entries.len(),
        })
    }

    async fn pair_waiting(&self) -> Vec<QueuePair> {
        let mut entries = self.entries.write().await;
        take_pairs(&mut entries, Instant::now(), &self.rules)
    }

    async fn evict_stale(&self) -> Vec<QueueEntry> {
        let now = Instant::now();

        // Snapshot candidates, then remove each one only if it is unchanged.
        let stale: Vec<(ContestantId, Instant)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|e| now.saturating_duration_since(e.joined_at) >= self.rules.stale_after)
                .map(|e| (e.contestant.id, e.joined_at))
                .collect()
        };

        let mut evicted = Vec::with_capacity(stale.len());
        for (id, joined_at) in stale {
            let mut entries = self.entries.write().await;
            if let Some(pos) = entries
                .iter()
                .position(|e| e.contestant.id == id && e.joined_at == joined_at)
            {
                info!(contestant = %id, "queue entry timed out");
                evicted.push(entries.remove(pos));
            }
        }
        evicted
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stats::StatVector;

    /// Entry whose stats sum to `power`.
    fn entry(id: u64, power: u32, wager: u64) -> QueueEntry {
        let base = power / 4;
        let stats = StatVector::new(base + power % 4, base, base, base);
        QueueEntry::new(
            Contestant::new(ContestantId(id), format!("racer-{}", id), stats),
            UserId::new(format!("user-{}", id)),
            id,
            wager,
        )
    }

    fn ids(pair: &QueuePair) -> (u64, u64) {
        (pair.first.contestant.id.get(), pair.second.contestant.id.get())
    }

    #[test]
    fn test_find_pair_prefers_close_power() {
        let now = Instant::now();
        let entries = vec![entry(1, 10, 50), entry(2, 12, 50), entry(3, 50, 50)];
        assert_eq!(find_pair(&entries, now, &PairingRules::default()), Some((0, 1)));
    }

    #[test]
    fn test_find_pair_skips_distant_oldest() {
        // Oldest entry has no close match; the younger two still pair.
        let now = Instant::now();
        let entries = vec![entry(3, 50, 50), entry(1, 10, 50), entry(2, 12, 50)];
        assert_eq!(find_pair(&entries, now, &PairingRules::default()), Some((1, 2)));
    }

    #[test]
    fn test_find_pair_requires_equal_wager() {
        let now = Instant::now();
        let entries = vec![entry(1, 100, 50), entry(2, 100, 60)];
        assert_eq!(find_pair(&entries, now, &PairingRules::default()), None);
    }

    #[test]
    fn test_find_pair_power_gap_boundary() {
        let now = Instant::now();
        let rules = PairingRules::default();
        assert!(find_pair(&[entry(1, 100, 50), entry(2, 115, 50)], now, &rules).is_some());
        assert!(find_pair(&[entry(1, 100, 50), entry(2, 116, 50)], now, &rules).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fairness_scenario_then_relaxation() {
        let queue = InMemoryQueue::default();

        assert!(queue.join(entry(10, 10, 50)).await.unwrap().is_empty());
        assert!(queue.join(entry(50, 50, 50)).await.unwrap().is_empty());

        let pairs = queue.join(entry(12, 12, 50)).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(ids(&pairs[0]), (10, 12));
        assert!(queue.status(ContestantId(50)).await.is_some());

        // A far-off newcomer cannot pair before the relaxation threshold.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(queue.join(entry(90, 90, 50)).await.unwrap().is_empty());
        assert!(queue.pair_waiting().await.is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let pairs = queue.pair_waiting().await;
        assert_eq!(pairs.len(), 1);
        assert_eq!(ids(&pairs[0]), (50, 90));
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaxation_still_requires_wager() {
        let queue = InMemoryQueue::default();
        queue.join(entry(1, 10, 50)).await.unwrap();
        queue.join(entry(2, 90, 75)).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(queue.pair_waiting().await.is_empty());
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected() {
        let queue = InMemoryQueue::default();
        queue.join(entry(1, 100, 50)).await.unwrap();

        let err = queue.join(entry(1, 100, 80)).await.unwrap_err();
        assert_eq!(err, QueueError::AlreadyQueued(ContestantId(1)));

        // Original entry untouched.
        assert_eq!(queue.status(ContestantId(1)).await.unwrap().wager, 50);
    }

    #[tokio::test]
    async fn test_leave_and_status() {
        let queue = InMemoryQueue::default();
        queue.join(entry(1, 100, 50)).await.unwrap();
        queue.join(entry(2, 200, 50)).await.unwrap();

        let status = queue.status(ContestantId(1)).await.unwrap();
        assert_eq!(status.queue_size, 2);
        assert_eq!(status.power_score, 100);

        assert!(queue.leave(ContestantId(1)).await.is_some());
        assert!(queue.leave(ContestantId(1)).await.is_none());
        assert!(queue.status(ContestantId(1)).await.is_none());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_evicted() {
        let rules = PairingRules::default();
        let queue = InMemoryQueue::new(rules);
        queue.join(entry(1, 10, 50)).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        queue.join(entry(2, 90, 75)).await.unwrap();

        tokio::time::advance(rules.stale_after - Duration::from_secs(60)).await;
        let evicted = queue.evict_stale().await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].contestant.id, ContestantId(1));
        assert!(queue.status(ContestantId(2)).await.is_some());
    }
}
