//! Ownership and Ledger
//!
//! Everything about money and ownership lives behind [`Ledger`]. The match
//! flow only asks: does this user own this contestant, what are its stats,
//! can the user cover the wager, and, once a match is decided, settle it.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::game::contestant::{Contestant, ContestantId};
use crate::network::auth::UserId;
use crate::network::session::{EndReason, Match, MatchId};

/// Transaction reason for a wager taken at settlement.
pub const REASON_WAGER: &str = "pvp_wager";

/// Transaction reason for a winner's payout.
pub const REASON_WIN: &str = "pvp_win";

/// Transaction reason for returning a wager when settlement cannot complete.
pub const REASON_REFUND: &str = "pvp_refund";

/// Ledger errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Account does not exist.
    #[error("unknown account {0}")]
    UnknownAccount(UserId),

    /// Balance does not cover the amount.
    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientFunds {
        /// Current balance.
        balance: u64,
        /// Requested amount.
        required: u64,
    },

    /// Winner is not a participant of the match.
    #[error("contestant {0} is not part of match {1}")]
    NotParticipant(ContestantId, MatchId),

    /// Roster could not be loaded.
    #[error("roster error: {0}")]
    Roster(String),

    /// Backend failure.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Persistent record of a decided match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Match id.
    pub match_id: MatchId,
    /// Contestants in participant order.
    pub contestants: [ContestantId; 2],
    /// Owners in participant order.
    pub users: [UserId; 2],
    /// Winning contestant.
    pub winner: ContestantId,
    /// Stake per side.
    pub wager: u64,
    /// Amount credited to the winner.
    pub payout: u64,
    /// Amount retained by the house.
    pub house_fee: u64,
    /// Whether the match was decided by disconnect.
    pub forfeit: bool,
    /// Race seed.
    pub seed: String,
    /// When the match ended.
    pub ended_at: DateTime<Utc>,
}

/// External ownership/balance service.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Whether `user` owns `contestant`.
    async fn owns_contestant(&self, user: &UserId, contestant: ContestantId) -> Result<bool, LedgerError>;

    /// Current name and stats of a contestant.
    async fn get_contestant(&self, contestant: ContestantId) -> Result<Option<Contestant>, LedgerError>;

    /// Current balance.
    async fn balance(&self, user: &UserId) -> Result<u64, LedgerError>;

    /// Take `amount` from the user's balance.
    async fn debit(&self, user: &UserId, amount: u64, reason: &str) -> Result<u64, LedgerError>;

    /// Add `amount` to the user's balance.
    async fn credit(&self, user: &UserId, amount: u64, reason: &str) -> Result<u64, LedgerError>;

    /// Store a match record.
    async fn record_match(&self, record: MatchRecord) -> Result<(), LedgerError>;
}

// =============================================================================
// SETTLEMENT
// =============================================================================

/// How a pot is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPolicy {
    /// House fee in basis points of the pot.
    pub house_fee_bps: u32,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self { house_fee_bps: 500 }
    }
}

impl SettlementPolicy {
    /// Split a pot into (payout, house fee). The fee rounds down.
    pub fn split(&self, pot: u64) -> (u64, u64) {
        let fee = (pot as u128 * self.house_fee_bps.min(10_000) as u128 / 10_000) as u64;
        (pot - fee, fee)
    }
}

/// Result of a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    /// Credited to the winner.
    pub payout: u64,
    /// Retained by the house.
    pub house_fee: u64,
}

/// Settle a decided match: take both wagers, pay the winner, record it.
///
/// All or nothing for balances: if a wager cannot be taken or the payout
/// cannot be credited, every wager already taken is refunded before the
/// error is returned. A failed `record_match` after the payout is logged and
/// does not undo the transfer.
pub async fn settle(
    ledger: &dyn Ledger,
    policy: &SettlementPolicy,
    m: &Match,
    winner: ContestantId,
) -> Result<SettlementReceipt, LedgerError> {
    let winner_user = m
        .participant(winner)
        .map(|p| p.user_id.clone())
        .ok_or(LedgerError::NotParticipant(winner, m.id))?;

    let pot = m.wager.saturating_mul(2);
    let (payout, house_fee) = policy.split(pot);

    let mut debited: Vec<&UserId> = Vec::with_capacity(m.participants.len());
    for p in &m.participants {
        if let Err(e) = ledger.debit(&p.user_id, m.wager, REASON_WAGER).await {
            refund(ledger, m, &debited).await;
            return Err(e);
        }
        debited.push(&p.user_id);
    }
    if let Err(e) = ledger.credit(&winner_user, payout, REASON_WIN).await {
        refund(ledger, m, &debited).await;
        return Err(e);
    }

    let forfeit = m.outcome.map(|o| o.reason == EndReason::Forfeit).unwrap_or(false);
    let recorded = ledger
        .record_match(MatchRecord {
            match_id: m.id,
            contestants: [m.participants[0].contestant.id, m.participants[1].contestant.id],
            users: [m.participants[0].user_id.clone(), m.participants[1].user_id.clone()],
            winner,
            wager: m.wager,
            payout,
            house_fee,
            forfeit,
            seed: m.seed.clone(),
            ended_at: m.ended_at.unwrap_or_else(Utc::now),
        })
        .await;
    if let Err(e) = recorded {
        error!(match_id = %m.id, error = %e, "match record not stored");
    }

    info!(match_id = %m.id, %winner, user = %winner_user, payout, house_fee, forfeit, "match settled");
    Ok(SettlementReceipt { payout, house_fee })
}

async fn refund(ledger: &dyn Ledger, m: &Match, users: &[&UserId]) {
    for user in users {
        match ledger.credit(user, m.wager, REASON_REFUND).await {
            Ok(_) => warn!(match_id = %m.id, %user, wager = m.wager, "wager refunded"),
            Err(e) => error!(match_id = %m.id, %user, error = %e, "wager refund failed"),
        }
    }
}

// =============================================================================
// IN-MEMORY LEDGER
// =============================================================================

/// One balance movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Account.
    pub user_id: UserId,
    /// Signed amount.
    pub amount: i64,
    /// Why.
    pub reason: String,
    /// When.
    pub at: DateTime<Utc>,
}

/// Account entry of a roster file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterAccount {
    /// Account id, matched against the token subject.
    pub user_id: UserId,
    /// Starting balance.
    pub balance: u64,
    /// Contestants the account owns.
    #[serde(default)]
    pub contestants: Vec<Contestant>,
}

/// Accounts and contestants to seed a [`MemoryLedger`] with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roster {
    /// Accounts.
    pub accounts: Vec<RosterAccount>,
}

#[derive(Default)]
struct LedgerState {
    balances: BTreeMap<UserId, u64>,
    owners: BTreeMap<ContestantId, UserId>,
    contestants: BTreeMap<ContestantId, Contestant>,
    transactions: Vec<Transaction>,
    records: Vec<MatchRecord>,
}

/// In-process ledger for local play and tests.
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from a roster.
    pub fn from_roster(roster: Roster) -> Self {
        let mut state = LedgerState::default();
        for account in roster.accounts {
            for c in account.contestants {
                state.owners.insert(c.id, account.user_id.clone());
                state.contestants.insert(c.id, c);
            }
            state.balances.insert(account.user_id, account.balance);
        }
        Self { state: RwLock::new(state) }
    }

    /// Load a JSON roster file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LedgerError::Roster(format!("{}: {}", path.display(), e)))?;
        let roster: Roster = serde_json::from_str(&raw)
            .map_err(|e| LedgerError::Roster(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_roster(roster))
    }

    /// Open an account.
    pub async fn add_account(&self, user: UserId, balance: u64) {
        self.state.write().await.balances.insert(user, balance);
    }

    /// Register a contestant owned by `user`.
    pub async fn add_contestant(&self, user: UserId, contestant: Contestant) {
        let mut state = self.state.write().await;
        state.owners.insert(contestant.id, user);
        state.contestants.insert(contestant.id, contestant);
    }

    /// Transaction log.
    pub async fn transactions(&self) -> Vec<Transaction> {
        self.state.read().await.transactions.clone()
    }

    /// Recorded matches.
    pub async fn records(&self) -> Vec<MatchRecord> {
        self.state.read().await.records.clone()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn owns_contestant(&self, user: &UserId, contestant: ContestantId) -> Result<bool, LedgerError> {
        Ok(self.state.read().await.owners.get(&contestant) == Some(user))
    }

    async fn get_contestant(&self, contestant: ContestantId) -> Result<Option<Contestant>, LedgerError> {
        Ok(self.state.read().await.contestants.get(&contestant).cloned())
    }

    async fn balance(&self, user: &UserId) -> Result<u64, LedgerError> {
        self.state
            .read()
            .await
            .balances
            .get(user)
            .copied()
            .ok_or_else(|| LedgerError::UnknownAccount(user.clone()))
    }

    async fn debit(&self, user: &UserId, amount: u64, reason: &str) -> Result<u64, LedgerError> {
        let mut state = self.state.write().await;
        let balance = state
            .balances
            .get_mut(user)
            .ok_or_else(|| LedgerError::UnknownAccount(user.clone()))?;
        if *balance < amount {
            warn!(%user, balance = *balance, amount, "debit refused");
            return Err(LedgerError::InsufficientFunds { balance: *balance, required: amount });
        }
        *balance -= amount;
        let remaining = *balance;
        state.transactions.push(Transaction {
            user_id: user.clone(),
            amount: -(amount as i64),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(remaining)
    }

    async fn credit(&self, user: &UserId, amount: u64, reason: &str) -> Result<u64, LedgerError> {
        let mut state = self.state.write().await;
        let balance = state
            .balances
            .get_mut(user)
            .ok_or_else(|| LedgerError::UnknownAccount(user.clone()))?;
        *balance = balance.saturating_add(amount);
        let updated = *balance;
        state.transactions.push(Transaction {
            user_id: user.clone(),
            amount: amount as i64,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(updated)
    }

    async fn record_match(&self, record: MatchRecord) -> Result<(), LedgerError> {
        self.state.write().await.records.push(record);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stats::StatVector;
    use crate::network::session::{MatchOutcome, MatchStatus, Participant};

    fn contestant(id: u64) -> Contestant {
        Contestant::new(ContestantId(id), format!("racer-{}", id), StatVector::new(30, 20, 30, 20))
    }

    fn finished_match(wager: u64, outcome: MatchOutcome) -> Match {
        let mut m = Match::new(
            [
                Participant {
                    user_id: UserId::new("alice"),
                    connection_id: 1,
                    contestant: contestant(1),
                },
                Participant {
                    user_id: UserId::new("bob"),
                    connection_id: 2,
                    contestant: contestant(2),
                },
            ],
            wager,
        );
        m.status = MatchStatus::Finished;
        m.outcome = Some(outcome);
        m.ended_at = Some(Utc::now());
        m
    }

    async fn funded_ledger() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.add_account(UserId::new("alice"), 1000).await;
        ledger.add_account(UserId::new("bob"), 1000).await;
        ledger.add_contestant(UserId::new("alice"), contestant(1)).await;
        ledger.add_contestant(UserId::new("bob"), contestant(2)).await;
        ledger
    }

    #[test]
    fn test_policy_split() {
        let policy = SettlementPolicy::default();
        assert_eq!(policy.split(200), (190, 10));
        // Fee rounds down.
        assert_eq!(policy.split(30), (29, 1));
        assert_eq!(policy.split(10), (10, 0));
        assert_eq!(SettlementPolicy { house_fee_bps: 0 }.split(200), (200, 0));
    }

    #[tokio::test]
    async fn test_ownership_and_profiles() {
        let ledger = funded_ledger().await;
        let alice = UserId::new("alice");

        assert!(ledger.owns_contestant(&alice, ContestantId(1)).await.unwrap());
        assert!(!ledger.owns_contestant(&alice, ContestantId(2)).await.unwrap());
        assert_eq!(ledger.get_contestant(ContestantId(2)).await.unwrap().unwrap().name, "racer-2");
        assert!(ledger.get_contestant(ContestantId(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_debit_refuses_overdraft() {
        let ledger = funded_ledger().await;
        let alice = UserId::new("alice");

        assert_eq!(ledger.debit(&alice, 400, "test").await.unwrap(), 600);
        assert_eq!(
            ledger.debit(&alice, 700, "test").await,
            Err(LedgerError::InsufficientFunds { balance: 600, required: 700 })
        );
        assert!(matches!(
            ledger.balance(&UserId::new("carol")).await,
            Err(LedgerError::UnknownAccount(_))
        ));
    }

    #[tokio::test]
    async fn test_settle_moves_pot_to_winner() {
        let ledger = funded_ledger().await;
        let m = finished_match(100, MatchOutcome::completed(ContestantId(2)));

        let receipt = settle(&ledger, &SettlementPolicy::default(), &m, ContestantId(2))
            .await
            .unwrap();

        assert_eq!(receipt, SettlementReceipt { payout: 190, house_fee: 10 });
        assert_eq!(ledger.balance(&UserId::new("alice")).await.unwrap(), 900);
        assert_eq!(ledger.balance(&UserId::new("bob")).await.unwrap(), 1090);

        let records = ledger.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].winner, ContestantId(2));
        assert!(!records[0].forfeit);

        let reasons: Vec<_> = ledger.transactions().await.into_iter().map(|t| t.reason).collect();
        assert_eq!(reasons, vec![REASON_WAGER, REASON_WAGER, REASON_WIN]);
    }

    #[tokio::test]
    async fn test_settle_records_forfeit() {
        let ledger = funded_ledger().await;
        let m = finished_match(50, MatchOutcome::forfeit(ContestantId(1)));

        settle(&ledger, &SettlementPolicy::default(), &m, ContestantId(1)).await.unwrap();
        assert!(ledger.records().await[0].forfeit);
    }

    #[tokio::test]
    async fn test_settle_rejects_outsider() {
        let ledger = funded_ledger().await;
        let m = finished_match(50, MatchOutcome::aborted());

        let err = settle(&ledger, &SettlementPolicy::default(), &m, ContestantId(7))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::NotParticipant(ContestantId(7), m.id));
        assert!(ledger.transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_settle_refunds_when_second_wager_fails() {
        let ledger = funded_ledger().await;
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        ledger.debit(&bob, 950, "spent elsewhere").await.unwrap();
        let m = finished_match(100, MatchOutcome::completed(ContestantId(1)));

        let err = settle(&ledger, &SettlementPolicy::default(), &m, ContestantId(1))
            .await
            .unwrap_err();

        assert_eq!(err, LedgerError::InsufficientFunds { balance: 50, required: 100 });
        assert_eq!(ledger.balance(&alice).await.unwrap(), 1000);
        assert_eq!(ledger.balance(&bob).await.unwrap(), 50);
        assert!(ledger.records().await.is_empty());

        let reasons: Vec<_> = ledger.transactions().await.into_iter().map(|t| t.reason).collect();
        assert_eq!(reasons, vec!["spent elsewhere", REASON_WAGER, REASON_REFUND]);
    }

    /// Accepts wagers but refuses to pay anyone out.
    struct PayoutOutage(MemoryLedger);

    #[async_trait]
    impl Ledger for PayoutOutage {
        async fn owns_contestant(&self, user: &UserId, contestant: ContestantId) -> Result<bool, LedgerError> {
            self.0.owns_contestant(user, contestant).await
        }

        async fn get_contestant(&self, contestant: ContestantId) -> Result<Option<Contestant>, LedgerError> {
            self.0.get_contestant(contestant).await
        }

        async fn balance(&self, user: &UserId) -> Result<u64, LedgerError> {
            self.0.balance(user).await
        }

        async fn debit(&self, user: &UserId, amount: u64, reason: &str) -> Result<u64, LedgerError> {
            self.0.debit(user, amount, reason).await
        }

        async fn credit(&self, user: &UserId, amount: u64, reason: &str) -> Result<u64, LedgerError> {
            if reason == REASON_WIN {
                return Err(LedgerError::Unavailable("payouts offline".to_string()));
            }
            self.0.credit(user, amount, reason).await
        }

        async fn record_match(&self, record: MatchRecord) -> Result<(), LedgerError> {
            self.0.record_match(record).await
        }
    }

    #[tokio::test]
    async fn test_settle_refunds_both_when_payout_fails() {
        let ledger = PayoutOutage(funded_ledger().await);
        let m = finished_match(100, MatchOutcome::completed(ContestantId(1)));

        let err = settle(&ledger, &SettlementPolicy::default(), &m, ContestantId(1))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Unavailable(_)));
        assert_eq!(ledger.0.balance(&UserId::new("alice")).await.unwrap(), 1000);
        assert_eq!(ledger.0.balance(&UserId::new("bob")).await.unwrap(), 1000);
        assert!(ledger.0.records().await.is_empty());
    }

    #[test]
    fn test_roster_parses() {
        let json = r#"{
            "accounts": [
                {
                    "user_id": "alice",
                    "balance": 500,
                    "contestants": [
                        {"id": 1, "name": "Bolt", "stats": {"speed": 40, "agility": 20, "endurance": 20, "luck": 20}}
                    ]
                },
                {"user_id": "bob", "balance": 250}
            ]
        }"#;
        let roster: Roster = serde_json::from_str(json).unwrap();
        let ledger = MemoryLedger::from_roster(roster);
        let state = ledger.state.try_read().unwrap();

        assert_eq!(state.balances.get(&UserId::new("bob")), Some(&250));
        assert_eq!(state.owners.get(&ContestantId(1)), Some(&UserId::new("alice")));
    }
}
