//! Background job scheduler.
//!
//! Runs the periodic ledger jobs (accrual sweep, pending promotion, fraud
//! sweep, rate-limit pruning) on their own intervals, independent of any
//! request-serving process. Before each run a job takes a store-backed lease
//! so that when several workers share a store only one of them executes a
//! given job per interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::accrual::AccrualEngine;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::fraud::FraudEngine;
use crate::promoter::PendingPromoter;
use crate::ratelimit::RateLimiter;
use crate::services::LedgerServices;
use crate::storage::LedgerStore;
use crate::utils::retry::with_conflict_retry;

/// A periodic unit of background work.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Lease name; must be unique per job.
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run(&self, now: DateTime<Utc>) -> Result<()>;
}

pub struct AccrualJob {
    engine: AccrualEngine,
    batch_size: u64,
    every: Duration,
}

#[async_trait]
impl ScheduledJob for AccrualJob {
    fn name(&self) -> &'static str {
        "accrual_sweep"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<()> {
        self.engine.sweep(now, self.batch_size).await.map(|_| ())
    }
}

pub struct PromotionJob {
    promoter: PendingPromoter,
    batch_size: u64,
    every: Duration,
}

#[async_trait]
impl ScheduledJob for PromotionJob {
    fn name(&self) -> &'static str {
        "pending_promotion"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<()> {
        self.promoter.promote_due(now, self.batch_size).await.map(|_| ())
    }
}

pub struct FraudSweepJob {
    fraud: FraudEngine,
    every: Duration,
}

#[async_trait]
impl ScheduledJob for FraudSweepJob {
    fn name(&self) -> &'static str {
        "fraud_sweep"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<()> {
        self.fraud.sweep(now).await.map(|_| ())
    }
}

pub struct RateLimitPruneJob {
    limiter: RateLimiter,
    every: Duration,
}

#[async_trait]
impl ScheduledJob for RateLimitPruneJob {
    fn name(&self) -> &'static str {
        "rate_limit_prune"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<()> {
        self.limiter.prune(now).await.map(|_| ())
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

/// Leased runner for [`ScheduledJob`]s.
pub struct Scheduler {
    store: Arc<dyn LedgerStore>,
    holder: String,
    lease_ttl: chrono::Duration,
    jobs: Vec<Arc<dyn ScheduledJob>>,
}

impl Scheduler {
    /// An empty scheduler. An empty `worker_id` gets a random one.
    pub fn new(store: Arc<dyn LedgerStore>, worker_id: &str, lease_ttl_secs: u64) -> Self {
        let holder = if worker_id.trim().is_empty() {
            format!("worker-{}", uuid::Uuid::new_v4())
        } else {
            worker_id.trim().to_string()
        };
        Self {
            store,
            holder,
            lease_ttl: chrono::Duration::seconds(lease_ttl_secs.clamp(1, u64::from(u32::MAX)) as i64),
            jobs: Vec::new(),
        }
    }

    /// The standard ledger jobs at their configured intervals.
    pub fn with_ledger_jobs(store: Arc<dyn LedgerStore>, services: &LedgerServices, config: &SchedulerConfig) -> Self {
        Self::new(store, &config.worker_id, config.lease_ttl_secs)
            .with_job(AccrualJob {
                engine: services.accrual.clone(),
                batch_size: config.batch_size,
                every: secs(config.accrual_interval_secs),
            })
            .with_job(PromotionJob {
                promoter: services.promoter.clone(),
                batch_size: config.batch_size,
                every: secs(config.promoter_interval_secs),
            })
            .with_job(FraudSweepJob {
                fraud: services.fraud.clone(),
                every: secs(config.fraud_sweep_interval_secs),
            })
            .with_job(RateLimitPruneJob {
                limiter: services.limiter.clone(),
                every: secs(config.rate_limit_prune_interval_secs),
            })
    }

    pub fn with_job(mut self, job: impl ScheduledJob + 'static) -> Self {
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }

    /// Run `job` once if its lease can be taken. Returns whether it ran.
    pub async fn run_once(&self, job: &dyn ScheduledJob, now: DateTime<Utc>) -> Result<bool> {
        let acquired = with_conflict_retry("acquire_lease", || self.acquire_lease(job.name(), now)).await?;
        if !acquired {
            debug!(job = job.name(), holder = %self.holder, "Lease held elsewhere; skipping");
            return Ok(false);
        }
        job.run(now).await?;
        Ok(true)
    }

    async fn acquire_lease(&self, name: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let acquired = tx
            .try_acquire_lease(name, &self.holder, now, now + self.lease_ttl)
            .await?;
        if acquired {
            tx.commit().await?;
        }
        Ok(acquired)
    }

    /// Run every job on its interval until `shutdown` turns true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(holder = %self.holder, jobs = ?self.job_names(), "Starting scheduler");
        let scheduler = Arc::new(self);
        let mut tasks = JoinSet::new();

        for job in scheduler.jobs.clone() {
            let scheduler = scheduler.clone();
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                let mut ticker = interval(job.interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                    if let Err(e) = scheduler.run_once(job.as_ref(), Utc::now()).await {
                        error!(job = job.name(), error = %e, "Scheduled job failed");
                    }
                }
                debug!(job = job.name(), "Job loop stopped");
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }
}
