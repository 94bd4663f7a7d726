//! ambled: the Amble companion daemon.
//!
//! Loads configuration, opens the store, registers the task roster, and runs
//! the scheduler loop until ctrl-c. Configuration problems are the only
//! fatal errors; everything after startup logs and carries on.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;

use amble::db::{CompanionDb, SharedDb};
use amble::{Engine, EngineConfig, EngineError};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), EngineError> {
    let config = EngineConfig::load()?;
    config.validate()?;
    log::info!(
        "Configuration loaded (tick {}s, escalation after {} runs)",
        config.tick_seconds,
        config.escalation_runs
    );

    let db: SharedDb = Arc::new(Mutex::new(CompanionDb::open()?));
    let users = db.lock().get_active_users()?;
    log::info!("Store open, {} active user(s)", users.len());

    let engine = Engine::new(db, config);
    engine.seed_roster(Utc::now())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = engine.scheduler().clone();
    let loop_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested, finishing current tick");
    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;

    Ok(())
}
