//! rewards-ledger-worker: background jobs for the rewards ledger
//!
//! Runs the accrual sweep, pending promotion, fraud sweep and rate-limit
//! pruning against the configured store until Ctrl+C. Several workers may
//! share one store; job leases keep each job to one runner per interval.
//!
//! ## Configuration
//! - LEDGER_CONFIG: path to a YAML config file (optional)
//! - LEDGER__*: environment overrides, e.g. LEDGER__STORAGE__TYPE=memory
//! - LEDGER_LOG: tracing filter (default: info)

use chrono::Utc;
use tokio::sync::watch;
use tracing::info;

use rewards_ledger::config::Config;
use rewards_ledger::scheduler::Scheduler;
use rewards_ledger::services::LedgerServices;
use rewards_ledger::storage::init_storage;
use rewards_ledger::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let store = init_storage(&config.storage).await?;
    let services = LedgerServices::new(store.clone(), &config);
    services.fraud.init_default_rules(Utc::now()).await?;

    let scheduler = Scheduler::with_ledger_jobs(store, &services, &config.scheduler);
    info!(holder = %scheduler.holder(), "rewards-ledger-worker started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(scheduler.run(shutdown_rx));

    shutdown_signal().await;
    shutdown_tx.send(true)?;
    worker.await?;

    info!("rewards-ledger-worker stopped");
    Ok(())
}
