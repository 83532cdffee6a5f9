//! Realtime Orchestrator
//!
//! Per-connection state machine layered over the queue and the registry:
//! `idle → queued → countdown → racing → idle`. The phase is always read back
//! from the queue and registry, never stored here.
//!
//! Transport agnostic: a connection is an id plus an outbound channel of
//! [`ServerMessage`]s. The WebSocket server feeds it text frames.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::game::contestant::ContestantId;
use crate::game::race::{simulate, FinalPosition, RaceConfig};
use crate::network::auth::{AuthError, IdentityProvider, UserId};
use crate::network::ledger::{settle, Ledger, LedgerError, SettlementPolicy};
use crate::network::protocol::{
    ClientMessage, ErrorCode, JoinQueueRequest, MatchFoundInfo, MatchResultInfo,
    QueueJoinedInfo, QueueStatusInfo, RaceEndInfo, RaceStartInfo, ServerError, ServerMessage,
};
use crate::network::queue::{InMemoryQueue, MatchQueue, PairingRules, QueueEntry, QueuePair};
use crate::network::session::{
    ConnectionId, Match, MatchId, MatchOutcome, MatchRegistry, MatchStatus, Participant,
    SessionManager,
};
use crate::network::tasks::MatchTasks;

/// Read an environment variable, falling back when unset or unparsable.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Match flow timings and rules.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Countdown steps before the race (3, 2, 1).
    pub countdown_steps: u32,
    /// Delay between countdown steps.
    pub countdown_interval: Duration,
    /// Delay between replayed frames.
    pub frame_interval: Duration,
    /// How long a finished match stays queryable.
    pub grace_period: Duration,
    /// Period of the pairing and staleness sweep.
    pub sweep_interval: Duration,
    /// Queue pairing thresholds.
    pub pairing: PairingRules,
    /// Pot split.
    pub settlement: SettlementPolicy,
    /// Race parameters.
    pub race: RaceConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            countdown_steps: 3,
            countdown_interval: Duration::from_secs(1),
            frame_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            pairing: PairingRules::default(),
            settlement: SettlementPolicy::default(),
            race: RaceConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            countdown_steps: env_or("COUNTDOWN_STEPS", d.countdown_steps),
            countdown_interval: Duration::from_millis(env_or(
                "COUNTDOWN_INTERVAL_MS",
                d.countdown_interval.as_millis() as u64,
            )),
            frame_interval: Duration::from_millis(env_or(
                "FRAME_INTERVAL_MS",
                d.frame_interval.as_millis() as u64,
            )),
            grace_period: Duration::from_secs(env_or("GRACE_PERIOD_SECS", d.grace_period.as_secs())),
            sweep_interval: Duration::from_millis(env_or(
                "SWEEP_INTERVAL_MS",
                d.sweep_interval.as_millis() as u64,
            )),
            pairing: PairingRules {
                max_power_gap: env_or("MAX_POWER_GAP", d.pairing.max_power_gap),
                relax_after: Duration::from_secs(env_or(
                    "PAIRING_RELAX_SECS",
                    d.pairing.relax_after.as_secs(),
                )),
                stale_after: Duration::from_secs(env_or(
                    "QUEUE_STALE_SECS",
                    d.pairing.stale_after.as_secs(),
                )),
            },
            settlement: SettlementPolicy {
                house_fee_bps: env_or("HOUSE_FEE_BPS", d.settlement.house_fee_bps),
            },
            race: d.race,
        }
    }
}

/// Where a connection is in the match flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Nothing queued or running.
    Idle,
    /// Waiting for an opponent.
    Queued,
    /// Paired, counting down.
    Countdown,
    /// Race replay in progress.
    Racing,
}

/// Connected client state.
struct Connection {
    /// Authenticated account.
    user: UserId,
    /// Outbound messages.
    sender: mpsc::Sender<ServerMessage>,
    /// Fired when the outbound buffer overflows; the transport should drop the socket.
    evict: Arc<Notify>,
    /// Contestant last entered from this connection.
    contestant: Option<ContestantId>,
}

/// Drives queueing, matches and settlement for all connections.
pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: Arc<dyn MatchQueue>,
    registry: Arc<dyn MatchRegistry>,
    identity: Arc<dyn IdentityProvider>,
    ledger: Arc<dyn Ledger>,
    tasks: MatchTasks,
    connections: RwLock<BTreeMap<ConnectionId, Connection>>,
    next_connection: AtomicU64,
    /// Set once shutdown starts; disconnects stop forfeiting.
    closing: AtomicBool,
    /// Serializes membership checks, queue joins and match creation. Never
    /// held across a send that can wait.
    admission: Mutex<()>,
}

impl Orchestrator {
    /// Create an orchestrator over the given collaborators.
    pub fn new(
        config: OrchestratorConfig,
        queue: Arc<dyn MatchQueue>,
        registry: Arc<dyn MatchRegistry>,
        identity: Arc<dyn IdentityProvider>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            config,
            queue,
            registry,
            identity,
            ledger,
            tasks: MatchTasks::new(),
            connections: RwLock::new(BTreeMap::new()),
            next_connection: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            admission: Mutex::new(()),
        }
    }

    /// Single-process orchestrator with in-memory queue and registry.
    pub fn in_memory(
        config: OrchestratorConfig,
        identity: Arc<dyn IdentityProvider>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let queue = Arc::new(InMemoryQueue::new(config.pairing));
        Self::new(config, queue, Arc::new(SessionManager::new()), identity, ledger)
    }

    /// Configuration in use.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Authenticate a new connection. Fails closed.
    pub async fn connect(
        &self,
        token: &str,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<ConnectionId, AuthError> {
        let user = self.identity.verify(token).await?;
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(id, Connection {
            user: user.clone(),
            sender,
            evict: Arc::new(Notify::new()),
            contestant: None,
        });
        info!(connection = id, %user, "connection authenticated");
        Ok(id)
    }

    /// Signal fired when a connection falls too far behind on outbound
    /// messages. The transport closes the socket, which leads to `disconnect`.
    pub async fn eviction_signal(&self, conn: ConnectionId) -> Option<Arc<Notify>> {
        Some(self.connections.read().await.get(&conn)?.evict.clone())
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of stored matches.
    pub async fn match_count(&self) -> usize {
        self.registry.len().await
    }

    /// Number of queued entries.
    pub async fn queue_size(&self) -> usize {
        self.queue.len().await
    }

    /// Current phase of a connection, derived from queue and registry.
    pub async fn phase(&self, conn: ConnectionId) -> ConnectionPhase {
        let contestant = match self.active_contestant(conn).await {
            Some(c) => c,
            None => return ConnectionPhase::Idle,
        };
        if let Some(status) = self.queue.status(contestant).await {
            if status.connection_id == conn {
                return ConnectionPhase::Queued;
            }
        }
        match self.live_match(contestant, conn).await.map(|m| m.status) {
            Some(MatchStatus::Waiting) | Some(MatchStatus::Countdown) => ConnectionPhase::Countdown,
            Some(MatchStatus::Racing) => ConnectionPhase::Racing,
            _ => ConnectionPhase::Idle,
        }
    }

    async fn active_contestant(&self, conn: ConnectionId) -> Option<ContestantId> {
        self.connections.read().await.get(&conn)?.contestant
    }

    async fn connection_user(&self, conn: ConnectionId) -> Option<UserId> {
        Some(self.connections.read().await.get(&conn)?.user.clone())
    }

    /// Unfinished match this connection plays `contestant` in.
    async fn live_match(&self, contestant: ContestantId, conn: ConnectionId) -> Option<Match> {
        self.registry
            .get_by_participant(contestant)
            .await
            .filter(|m| m.status != MatchStatus::Finished)
            .filter(|m| m.participant(contestant).map(|p| p.connection_id) == Some(conn))
    }

    /// Queue a message without waiting. A connection whose buffer is full is
    /// evicted instead of slowing down the caller.
    async fn send(&self, conn: ConnectionId, msg: ServerMessage) {
        let target = self
            .connections
            .read()
            .await
            .get(&conn)
            .map(|c| (c.sender.clone(), c.evict.clone()));
        let (sender, evict) = match target {
            Some(t) => t,
            None => {
                debug!(connection = conn, "send to unknown connection");
                return;
            }
        };
        match sender.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(connection = conn, "outbound buffer full, evicting connection");
                evict.notify_one();
            }
            Err(TrySendError::Closed(_)) => debug!(connection = conn, "outbound channel closed"),
        }
    }

    async fn send_error(&self, conn: ConnectionId, err: ServerError) {
        self.send(conn, ServerMessage::Error(err)).await;
    }

    /// Send the same message to both sides, in participant order.
    async fn broadcast(&self, m: &Match, msg: ServerMessage) {
        for p in &m.participants {
            self.send(p.connection_id, msg.clone()).await;
        }
    }

    // =========================================================================
    // INBOUND MESSAGES
    // =========================================================================

    /// Handle a raw text frame.
    pub async fn handle_text(self: &Arc<Self>, conn: ConnectionId, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(msg) => self.handle(conn, msg).await,
            Err(e) => {
                debug!(connection = conn, error = %e, "invalid message");
                self.send_error(conn, ServerError::new(ErrorCode::InvalidMessage, e.to_string()))
                    .await;
            }
        }
    }

    /// Handle a parsed client message.
    pub async fn handle(self: &Arc<Self>, conn: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::JoinQueue(req) => {
                if let Err(err) = self.join_queue(conn, req).await {
                    debug!(connection = conn, code = ?err.code, "join rejected");
                    self.send_error(conn, err).await;
                }
            }
            ClientMessage::LeaveQueue => self.leave_queue(conn).await,
            ClientMessage::QueueStatus => self.queue_status(conn).await,
            ClientMessage::MatchResult { match_id } => self.match_result(conn, match_id).await,
            ClientMessage::PlayerReady { match_id } => self.player_ready(conn, match_id).await,
            ClientMessage::Ping { timestamp } => {
                let server_time = chrono::Utc::now().timestamp_millis().max(0) as u64;
                self.send(conn, ServerMessage::Pong { timestamp, server_time }).await;
            }
        }
    }

    /// Validate and queue a contestant, pairing it if possible.
    #[instrument(skip(self, req), fields(contestant = %req.contestant_id, wager = req.wager))]
    async fn join_queue(self: &Arc<Self>, conn: ConnectionId, req: JoinQueueRequest) -> Result<(), ServerError> {
        req.validate()?;
        let user = self
            .connection_user(conn)
            .await
            .ok_or_else(|| ServerError::new(ErrorCode::InternalError, "unknown connection"))?;
        let contestant_id = req.contestant_id;

        let _admission = self.admission.lock().await;

        match self.phase(conn).await {
            ConnectionPhase::Idle => {}
            ConnectionPhase::Queued => {
                return Err(ServerError::new(ErrorCode::AlreadyQueued, "already waiting in the queue"));
            }
            ConnectionPhase::Countdown | ConnectionPhase::Racing => {
                return Err(ServerError::new(ErrorCode::AlreadyInMatch, "already in a match"));
            }
        }
        if self.queue.status(contestant_id).await.is_some() {
            return Err(ServerError::new(ErrorCode::AlreadyQueued, "contestant is already queued"));
        }
        if let Some(m) = self.registry.get_by_participant(contestant_id).await {
            if m.status != MatchStatus::Finished {
                return Err(ServerError::new(ErrorCode::AlreadyInMatch, "contestant is already in a match"));
            }
        }

        let contestant = self
            .ledger
            .get_contestant(contestant_id)
            .await
            .map_err(ledger_failure)?
            .ok_or_else(|| ServerError::new(ErrorCode::UnknownContestant, "contestant not found"))?;
        contestant
            .stats
            .validate()
            .map_err(|e| ServerError::new(ErrorCode::UnknownContestant, e.to_string()))?;

        if !self.ledger.owns_contestant(&user, contestant_id).await.map_err(ledger_failure)? {
            return Err(ServerError::new(ErrorCode::NotOwner, "contestant belongs to another account"));
        }

        let balance = match self.ledger.balance(&user).await {
            Ok(b) => b,
            Err(LedgerError::UnknownAccount(_)) => 0,
            Err(e) => return Err(ledger_failure(e)),
        };
        if balance < req.wager {
            return Err(ServerError::new(
                ErrorCode::InsufficientStake,
                format!("balance {} does not cover wager {}", balance, req.wager),
            ));
        }

        if let Some(c) = self.connections.write().await.get_mut(&conn) {
            c.contestant = Some(contestant_id);
        }
        let entry = QueueEntry::new(contestant, user.clone(), conn, req.wager);
        let pairs = self
            .queue
            .join(entry)
            .await
            .map_err(|e| ServerError::new(ErrorCode::AlreadyQueued, e.to_string()))?;

        info!(connection = conn, %user, "contestant queued");
        self.send(conn, ServerMessage::QueueJoined(QueueJoinedInfo {
            contestant_id,
            wager: req.wager,
            queue_size: self.queue.len().await,
        }))
        .await;

        for pair in pairs {
            self.start_match(pair).await;
        }
        Ok(())
    }

    async fn leave_queue(&self, conn: ConnectionId) {
        let removed = {
            let _admission = self.admission.lock().await;
            self.remove_queued(conn).await
        };
        if let Some(entry) = &removed {
            info!(connection = conn, contestant = %entry.contestant_id(), "left queue");
        }
        self.send(conn, ServerMessage::QueueLeft {
            contestant_id: removed.map(|e| e.contestant_id()),
        })
        .await;
    }

    /// Remove this connection's queue entry, if it has one. Caller holds admission.
    async fn remove_queued(&self, conn: ConnectionId) -> Option<QueueEntry> {
        let contestant = self.active_contestant(conn).await?;
        let status = self.queue.status(contestant).await?;
        if status.connection_id != conn {
            return None;
        }
        self.queue.leave(contestant).await
    }

    async fn queue_status(&self, conn: ConnectionId) {
        let queued = match self.active_contestant(conn).await {
            Some(c) => self.queue.status(c).await.filter(|s| s.connection_id == conn),
            None => None,
        };
        let queue_size = self.queue.len().await;
        let info = match queued {
            Some(s) => QueueStatusInfo {
                in_queue: true,
                contestant_id: Some(s.contestant_id),
                wait_ms: Some(s.wait.as_millis() as u64),
                queue_size,
            },
            None => QueueStatusInfo {
                in_queue: false,
                contestant_id: None,
                wait_ms: None,
                queue_size,
            },
        };
        self.send(conn, ServerMessage::QueueStatus(info)).await;
    }

    async fn match_result(&self, conn: ConnectionId, match_id: MatchId) {
        let user = self.connection_user(conn).await;
        let found = self
            .registry
            .get(match_id)
            .await
            .filter(|m| m.participants.iter().any(|p| Some(&p.user_id) == user.as_ref()));

        let m = match found {
            Some(m) => m,
            None => {
                self.send_error(conn, ServerError::new(ErrorCode::MatchNotFound, format!("match {} not found", match_id)))
                    .await;
                return;
            }
        };

        let info = MatchResultInfo {
            match_id,
            status: m.status,
            winner_id: m.outcome.and_then(|o| o.winner),
            reason: m.outcome.map(|o| o.reason),
            wager: m.wager,
            seed: m.seed.clone(),
            fingerprint: m.result.as_ref().map(|r| hex::encode(r.fingerprint())),
            final_positions: m
                .result
                .as_ref()
                .filter(|_| m.status == MatchStatus::Finished)
                .map(|r| r.final_positions.to_vec())
                .unwrap_or_default(),
        };
        self.send(conn, ServerMessage::MatchResult(info)).await;
    }

    /// Relay a participant's ready signal to the other side.
    async fn player_ready(&self, conn: ConnectionId, match_id: MatchId) {
        let found = self
            .registry
            .get(match_id)
            .await
            .filter(|m| m.status != MatchStatus::Finished);
        let relay = found.as_ref().and_then(|m| {
            let me = m.participants.iter().find(|p| p.connection_id == conn)?;
            let opponent = m.opponent_of(me.contestant.id)?;
            Some((me.contestant.id, opponent.connection_id))
        });

        match relay {
            Some((contestant_id, opponent)) => {
                debug!(%match_id, %contestant_id, "participant ready");
                self.send(opponent, ServerMessage::OpponentReady { match_id, contestant_id })
                    .await;
            }
            None => {
                self.send_error(conn, ServerError::new(ErrorCode::MatchNotFound, format!("match {} not found", match_id)))
                    .await;
            }
        }
    }

    // =========================================================================
    // MATCH LIFECYCLE
    // =========================================================================

    /// Create a match for a pair and start its task. Caller holds admission.
    ///
    /// Nothing is sent here; the match task announces the pairing.
    async fn start_match(self: &Arc<Self>, pair: QueuePair) {
        let wager = pair.first.wager;
        let participants = [pair.first, pair.second].map(|e| Participant {
            user_id: e.user_id,
            connection_id: e.connection_id,
            contestant: e.contestant,
        });

        let m = match self.registry.create(participants, wager).await {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "failed to create match for pair");
                return;
            }
        };

        info!(match_id = %m.id, wager, "match created");
        let this = Arc::clone(self);
        let id = m.id;
        self.tasks
            .spawn(id, async move {
                this.run_match(id).await;
                this.tasks.release(id).await;
            })
            .await;
    }

    /// Announce the pairing, count down, simulate once, replay frames, settle,
    /// then linger for the grace period.
    #[instrument(skip(self))]
    async fn run_match(self: &Arc<Self>, id: MatchId) {
        let m = match self.registry.get(id).await {
            Some(m) => m,
            None => return,
        };

        for (i, p) in m.participants.iter().enumerate() {
            let opponent = &m.participants[1 - i];
            self.send(p.connection_id, ServerMessage::MatchFound(MatchFoundInfo {
                match_id: id,
                contestant: p.contestant.summary(),
                opponent: opponent.contestant.summary(),
                wager: m.wager,
            }))
            .await;
        }

        if self.registry.transition(id, MatchStatus::Countdown).await.is_err() {
            return;
        }

        for value in (1..=self.config.countdown_steps).rev() {
            self.broadcast(&m, ServerMessage::Countdown { match_id: id, value }).await;
            sleep(self.config.countdown_interval).await;
        }

        let [first, second] = &m.participants;
        let result = match simulate(&first.contestant, &second.contestant, &m.seed, &self.config.race) {
            Ok(r) => r,
            Err(e) => {
                error!(match_id = %id, error = %e, "simulation failed, aborting match");
                self.broadcast(&m, ServerMessage::Error(ServerError::new(ErrorCode::SimulationFailed, e.to_string())))
                    .await;
                if self.registry.finish(id, MatchOutcome::aborted()).await.is_ok() {
                    self.registry.destroy(id).await;
                }
                return;
            }
        };

        if let Err(e) = self.registry.attach_result(id, result.clone()).await {
            debug!(match_id = %id, error = %e, "match ended before race start");
            return;
        }
        if self.registry.transition(id, MatchStatus::Racing).await.is_err() {
            return;
        }

        self.broadcast(&m, ServerMessage::RaceStart(RaceStartInfo {
            match_id: id,
            contestants: [first.contestant.summary(), second.contestant.summary()],
            race_distance: self.config.race.distance,
            total_frames: result.frames.len(),
            fingerprint: hex::encode(result.fingerprint()),
        }))
        .await;
        info!(match_id = %id, frames = result.frames.len(), winner = %result.winner_id, "race started");

        let mut ticker = interval(self.config.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let frame = match self.registry.current_frame(id).await {
                Some(f) => f,
                None => break,
            };
            self.broadcast(&m, ServerMessage::RaceFrame { match_id: id, frame }).await;
            match self.registry.advance(id).await {
                Ok(true) => {}
                Ok(false) | Err(_) => break,
            }
        }

        let finished = match self.registry.finish(id, MatchOutcome::completed(result.winner_id)).await {
            Ok(m) => m,
            Err(e) => {
                debug!(match_id = %id, error = %e, "match already finished");
                return;
            }
        };

        let payout = self.settle_match(&finished, result.winner_id).await;
        self.broadcast(&finished, ServerMessage::RaceEnd(RaceEndInfo {
            match_id: id,
            winner_id: result.winner_id,
            final_positions: result.final_positions.to_vec(),
            payout,
            forfeit: false,
        }))
        .await;

        sleep(self.config.grace_period).await;
        self.registry.destroy(id).await;
    }

    /// Settle a finished match. Returns the payout, or zero on failure.
    async fn settle_match(&self, m: &Match, winner: ContestantId) -> u64 {
        match settle(self.ledger.as_ref(), &self.config.settlement, m, winner).await {
            Ok(receipt) => receipt.payout,
            Err(e) => {
                error!(match_id = %m.id, %winner, error = %e, "settlement failed");
                self.broadcast(m, ServerMessage::Error(ServerError::new(ErrorCode::SettlementFailed, e.to_string())))
                    .await;
                0
            }
        }
    }

    /// Positions as of the last replayed frame.
    fn positions_so_far(&self, m: &Match) -> Vec<FinalPosition> {
        let result = match &m.result {
            Some(r) => r,
            None => return Vec::new(),
        };
        let frame = match m.cursor.checked_sub(1).and_then(|i| result.frames.get(i)) {
            Some(f) => f,
            None => return Vec::new(),
        };
        frame
            .positions
            .iter()
            .zip(&m.participants)
            .map(|(racer, p)| FinalPosition {
                contestant_id: racer.contestant_id,
                name: p.contestant.name.clone(),
                position: racer.position,
                finished: racer.position >= self.config.race.distance,
            })
            .collect()
    }

    // =========================================================================
    // DISCONNECT
    // =========================================================================

    /// Tear down a connection: leave the queue, or forfeit a running match.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let live = {
            let _admission = self.admission.lock().await;
            let queued = self.remove_queued(conn).await;
            let contestant = self.active_contestant(conn).await;
            let removed = self.connections.write().await.remove(&conn);
            if removed.is_none() {
                return;
            }
            if let Some(entry) = queued {
                info!(connection = conn, contestant = %entry.contestant_id(), "queued contestant dropped on disconnect");
                None
            } else {
                match contestant {
                    Some(c) => self.live_match(c, conn).await.map(|m| (m, c)),
                    None => None,
                }
            }
        };

        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        match live {
            Some((m, leaver)) if m.status == MatchStatus::Waiting => self.abort_match(m, leaver).await,
            Some((m, leaver)) => self.forfeit(m, leaver).await,
            None => debug!(connection = conn, "connection closed"),
        }
    }

    /// Abort a match that never started. No money moves.
    async fn abort_match(&self, m: Match, leaver: ContestantId) {
        if self.registry.finish(m.id, MatchOutcome::aborted()).await.is_err() {
            return;
        }
        self.tasks.cancel(m.id).await;
        warn!(match_id = %m.id, %leaver, "match aborted before countdown");
        if let Some(opponent) = m.opponent_of(leaver) {
            self.send(opponent.connection_id, ServerMessage::OpponentDisconnected {
                match_id: m.id,
                reason: "opponent left before the race".to_string(),
            })
            .await;
        }
        self.registry.destroy(m.id).await;
    }

    /// Award a running match to the side that stayed.
    async fn forfeit(&self, m: Match, leaver: ContestantId) {
        let winner = match m.opponent_of(leaver) {
            Some(p) => p.clone(),
            None => return,
        };
        let finished = match self.registry.finish(m.id, MatchOutcome::forfeit(winner.contestant.id)).await {
            Ok(f) => f,
            Err(e) => {
                debug!(match_id = %m.id, error = %e, "forfeit lost race with completion");
                return;
            }
        };
        self.tasks.cancel(m.id).await;
        warn!(match_id = %m.id, %leaver, winner = %winner.contestant.id, "match forfeited");

        self.send(winner.connection_id, ServerMessage::OpponentDisconnected {
            match_id: m.id,
            reason: "opponent disconnected".to_string(),
        })
        .await;

        let payout = self.settle_match(&finished, winner.contestant.id).await;
        self.send(winner.connection_id, ServerMessage::RaceEnd(RaceEndInfo {
            match_id: m.id,
            winner_id: winner.contestant.id,
            final_positions: self.positions_so_far(&finished),
            payout,
            forfeit: true,
        }))
        .await;

        self.registry.destroy(m.id).await;
    }

    // =========================================================================
    // BACKGROUND
    // =========================================================================

    /// One pass of pairing relaxed entries and evicting stale ones.
    pub async fn sweep_once(self: &Arc<Self>) {
        {
            let _admission = self.admission.lock().await;
            for pair in self.queue.pair_waiting().await {
                self.start_match(pair).await;
            }
        }

        for entry in self.queue.evict_stale().await {
            self.send_error(
                entry.connection_id,
                ServerError::new(ErrorCode::QueueTimeout, "no opponent found in time"),
            )
            .await;
        }
    }

    /// Run the sweep forever at the configured interval.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Stop all match tasks and tell every connection.
    ///
    /// Running matches are abandoned unsettled.
    pub async fn shutdown(&self, reason: &str) {
        self.closing.store(true, Ordering::SeqCst);
        let cancelled = self.tasks.cancel_all().await;
        if cancelled > 0 {
            warn!(cancelled, "match tasks cancelled by shutdown");
        }
        let senders: Vec<_> = self
            .connections
            .read()
            .await
            .values()
            .map(|c| c.sender.clone())
            .collect();
        for sender in senders {
            let _ = sender.try_send(ServerMessage::Shutdown { reason: reason.to_string() });
        }
    }
}

fn ledger_failure(err: LedgerError) -> ServerError {
    error!(error = %err, "ledger call failed");
    ServerError::new(ErrorCode::InternalError, "ledger unavailable")
}

// =============================================================================
// TESTS
// =============================================================================
