//! Network Layer
//!
//! Matchmaking, match sessions, settlement and the WebSocket transport.
//! This layer is **non-deterministic** - all race logic runs through `game/`.

pub mod auth;
pub mod ledger;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod tasks;

pub use auth::{AuthConfig, AuthError, IdentityProvider, JwtIdentityProvider, TokenClaims, UserId, validate_token};
pub use ledger::{Ledger, LedgerError, MemoryLedger, SettlementPolicy, SettlementReceipt, settle};
pub use orchestrator::{ConnectionPhase, Orchestrator, OrchestratorConfig};
pub use protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
pub use queue::{InMemoryQueue, MatchQueue, PairingRules, QueueEntry, QueueError};
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{ConnectionId, Match, MatchId, MatchRegistry, MatchStatus, RegistryError, SessionManager};
pub use tasks::MatchTasks;
