//! Duel Race Server
//!
//! Authoritative server for head-to-head wager races.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duel_race::{
    VERSION, RACE_DISTANCE, RACE_DURATION_STEPS,
    network::{
        AuthConfig, GameServer, JwtIdentityProvider, MemoryLedger, Orchestrator,
        OrchestratorConfig, ServerConfig,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Duel Race Server v{}", VERSION);
    info!("Race: {} units, {} steps", RACE_DISTANCE, RACE_DURATION_STEPS);

    let auth = AuthConfig::from_env();
    if !auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; every connection will be rejected");
    }

    let ledger = match std::env::var("ROSTER_PATH") {
        Ok(path) => {
            let ledger = MemoryLedger::load(&path)
                .with_context(|| format!("loading roster from {}", path))?;
            info!("Roster loaded from {}", path);
            ledger
        }
        Err(_) => {
            warn!("ROSTER_PATH not set; starting with an empty ledger");
            MemoryLedger::new()
        }
    };

    let orchestrator = Arc::new(Orchestrator::in_memory(
        OrchestratorConfig::from_env(),
        Arc::new(JwtIdentityProvider::new(auth)),
        Arc::new(ledger),
    ));
    let server = Arc::new(GameServer::new(ServerConfig::from_env(), orchestrator));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_server.shutdown();
        }
    });

    server.run().await.context("server stopped")?;
    info!("Server stopped");
    Ok(())
}
