//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON text frames tagged by `type`.

use serde::{Serialize, Deserialize};

use crate::game::contestant::{ContestantId, ContestantSummary};
use crate::game::race::{FinalPosition, Frame};
use crate::network::session::{EndReason, MatchId, MatchStatus};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter matchmaking with a contestant.
    JoinQueue(JoinQueueRequest),

    /// Leave matchmaking.
    LeaveQueue,

    /// Ask for the current queue position.
    QueueStatus,

    /// Ask for the outcome of a recent match.
    MatchResult { match_id: MatchId },

    /// Tell the opponent this side is ready.
    PlayerReady { match_id: MatchId },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinQueueRequest {
    /// Contestant to enter.
    pub contestant_id: ContestantId,
    /// Stake, in ledger units.
    pub wager: u64,
}

impl JoinQueueRequest {
    /// Shape checks that need no collaborator.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.wager == 0 {
            return Err(ServerError::new(ErrorCode::InvalidWager, "wager must be positive"));
        }
        Ok(())
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Entered the queue.
    QueueJoined(QueueJoinedInfo),

    /// Left the queue.
    QueueLeft { contestant_id: Option<ContestantId> },

    /// Queue position.
    QueueStatus(QueueStatusInfo),

    /// Paired with an opponent.
    MatchFound(MatchFoundInfo),

    /// Countdown step before the start.
    Countdown { match_id: MatchId, value: u32 },

    /// Race replay begins.
    RaceStart(RaceStartInfo),

    /// One replayed frame.
    RaceFrame { match_id: MatchId, frame: Frame },

    /// Race decided.
    RaceEnd(RaceEndInfo),

    /// The other side dropped.
    OpponentDisconnected { match_id: MatchId, reason: String },

    /// The other side signalled ready.
    OpponentReady { match_id: MatchId, contestant_id: ContestantId },

    /// Answer to a match result query.
    MatchResult(MatchResultInfo),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Queue join confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJoinedInfo {
    /// Queued contestant.
    pub contestant_id: ContestantId,
    /// Stake.
    pub wager: u64,
    /// Entries waiting, including this one.
    pub queue_size: usize,
}

/// Queue position report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatusInfo {
    /// Whether the connection has a queued contestant.
    pub in_queue: bool,
    /// Queued contestant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contestant_id: Option<ContestantId>,
    /// Time waited so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
    /// Entries waiting.
    pub queue_size: usize,
}

/// Pairing notification, addressed to one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFoundInfo {
    /// Match identifier.
    pub match_id: MatchId,
    /// The recipient's contestant.
    pub contestant: ContestantSummary,
    /// The other side.
    pub opponent: ContestantSummary,
    /// Stake per side.
    pub wager: u64,
}

/// Race start notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceStartInfo {
    /// Match identifier.
    pub match_id: MatchId,
    /// Both contestants, in participant order.
    pub contestants: [ContestantSummary; 2],
    /// Distance to the finish line.
    pub race_distance: f64,
    /// Frames that will follow.
    pub total_frames: usize,
    /// Hex fingerprint of the precomputed result.
    pub fingerprint: String,
}

/// Race end notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceEndInfo {
    /// Match identifier.
    pub match_id: MatchId,
    /// Winner.
    pub winner_id: ContestantId,
    /// Positions at the end, in participant order. Empty if the race never started.
    pub final_positions: Vec<FinalPosition>,
    /// Amount credited to the winner. Zero if settlement failed.
    pub payout: u64,
    /// Whether the match was decided by disconnect.
    pub forfeit: bool,
}

/// Outcome of a recent match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResultInfo {
    /// Match identifier.
    pub match_id: MatchId,
    /// Current status.
    pub status: MatchStatus,
    /// Winner, once decided.
    pub winner_id: Option<ContestantId>,
    /// How it ended.
    pub reason: Option<EndReason>,
    /// Stake per side.
    pub wager: u64,
    /// Race seed.
    pub seed: String,
    /// Hex fingerprint, once simulated.
    pub fingerprint: Option<String>,
    /// Final positions, once simulated.
    pub final_positions: Vec<FinalPosition>,
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Create an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<ServerError> for ServerMessage {
    fn from(err: ServerError) -> Self {
        ServerMessage::Error(err)
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Malformed or unknown message.
    InvalidMessage,
    /// Contestant does not exist or has invalid stats.
    UnknownContestant,
    /// Contestant belongs to someone else.
    NotOwner,
    /// Balance does not cover the wager.
    InsufficientStake,
    /// Wager is not acceptable.
    InvalidWager,
    /// Already waiting in the queue.
    AlreadyQueued,
    /// Already in a live match.
    AlreadyInMatch,
    /// Queue entry expired.
    QueueTimeout,
    /// Match not found.
    MatchNotFound,
    /// Race could not be simulated.
    SimulationFailed,
    /// Ledger rejected the settlement.
    SettlementFailed,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_queue_wire_format() {
        let msg = ClientMessage::from_json(r#"{"type":"join_queue","contestant_id":7,"wager":50}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinQueue(JoinQueueRequest { contestant_id: ContestantId(7), wager: 50 })
        );
    }

    #[test]
    fn test_unit_messages_parse() {
        assert_eq!(ClientMessage::from_json(r#"{"type":"leave_queue"}"#).unwrap(), ClientMessage::LeaveQueue);
        assert_eq!(ClientMessage::from_json(r#"{"type":"queue_status"}"#).unwrap(), ClientMessage::QueueStatus);
    }

    #[test]
    fn test_malformed_messages_rejected() {
        // Missing wager.
        assert!(ClientMessage::from_json(r#"{"type":"join_queue","contestant_id":7}"#).is_err());
        // Negative wager does not fit.
        assert!(ClientMessage::from_json(r#"{"type":"join_queue","contestant_id":7,"wager":-5}"#).is_err());
        // Unknown type.
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_zero_wager_invalid() {
        let req = JoinQueueRequest { contestant_id: ContestantId(1), wager: 0 };
        assert_eq!(req.validate().unwrap_err().code, ErrorCode::InvalidWager);

        let req = JoinQueueRequest { contestant_id: ContestantId(1), wager: 10 };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_ready_messages() {
        let id = MatchId::new_v4();
        let raw = format!(r#"{{"type":"player_ready","match_id":"{}"}}"#, id);
        assert_eq!(ClientMessage::from_json(&raw).unwrap(), ClientMessage::PlayerReady { match_id: id });

        let json = ServerMessage::OpponentReady { match_id: id, contestant_id: ContestantId(2) }
            .to_json()
            .unwrap();
        assert!(json.contains(r#""type":"opponent_ready""#));
        assert!(json.contains(r#""contestant_id":2"#));
    }

    #[test]
    fn test_server_message_tags() {
        let id = MatchId::new_v4();
        let json = ServerMessage::Countdown { match_id: id, value: 3 }.to_json().unwrap();
        assert!(json.contains(r#""type":"countdown""#));
        assert!(json.contains(r#""value":3"#));

        let json = ServerMessage::QueueLeft { contestant_id: None }.to_json().unwrap();
        assert!(json.contains(r#""type":"queue_left""#));
    }

    #[test]
    fn test_queue_status_omits_empty_fields() {
        let msg = ServerMessage::QueueStatus(QueueStatusInfo {
            in_queue: false,
            contestant_id: None,
            wait_ms: None,
            queue_size: 4,
        });
        let json = msg.to_json().unwrap();
        assert!(!json.contains("wait_ms"));
        assert!(json.contains(r#""queue_size":4"#));
    }

    #[test]
    fn test_error_codes() {
        let msg: ServerMessage = ServerError::new(ErrorCode::InsufficientStake, "balance too low").into();
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("insufficient_stake"));

        let parsed = ServerMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
    }
}
