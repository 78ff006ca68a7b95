//! Mining accrual engine.
//!
//! A session earns `deposited_amount * rate` per 24 hours, credited in
//! increments floored to the asset's minimum unit and capped at
//! `deposited_amount * rate` over its lifetime. The increment, the session's
//! new checkpoint and the balance posting are written in one unit of work, so
//! a time range is credited at most once no matter how many callers race.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::asset::Asset;
use crate::error::{LedgerError, Result};
use crate::model::{AccountId, EntryKind, MiningSession, NewAudit, Posting, SessionId};
use crate::storage::{LedgerStore, LedgerTx};
use crate::utils::retry::with_conflict_retry;

const MICROS_PER_DAY: Decimal = dec!(86400000000);
const SECONDS_PER_DAY: Decimal = dec!(86400);

/// Outcome of one accrual computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accrual {
    /// Amount to credit; never negative.
    pub increment: Decimal,
    /// Checkpoint the session moves to.
    pub checkpoint: DateTime<Utc>,
    /// Whether the session has reached its lifetime cap after this increment.
    pub capped: bool,
}

/// Compute the reward owed to `session` between its checkpoint and `now`.
///
/// Pure; the caller persists the result. The checkpoint only moves when
/// something is credited (or the cap is reached), and then only as far as the
/// credited amount covers, so sub-unit remainders keep accumulating across
/// frequent calls instead of being dropped.
pub fn accrue(session: &MiningSession, now: DateTime<Utc>) -> Accrual {
    let checkpoint = session.checkpoint();
    let unchanged = Accrual {
        increment: Decimal::ZERO,
        checkpoint,
        capped: session.is_capped(),
    };

    if !session.is_active || session.is_paused {
        return unchanged;
    }

    let remaining = session.cap() - session.mined_amount;
    if remaining <= Decimal::ZERO {
        return Accrual {
            capped: true,
            ..unchanged
        };
    }

    let elapsed = match (now - checkpoint).num_microseconds() {
        Some(micros) if micros > 0 => Decimal::from(micros),
        Some(_) => return unchanged,
        // More elapsed time than fits in i64 microseconds: certainly past the cap.
        None => Decimal::MAX,
    };

    let daily = session.deposited_amount.checked_mul(session.rate);
    let raw = daily
        .and_then(|daily| daily.checked_mul(elapsed))
        .map(|total| total / MICROS_PER_DAY)
        .unwrap_or(remaining);

    let increment = session
        .asset
        .floor(raw.min(remaining))
        .max(Decimal::ZERO);
    let capped = increment == remaining;

    if increment.is_zero() && !capped {
        return unchanged;
    }

    // Advance only by the time the floored increment paid for; the sub-unit
    // remainder stays behind the checkpoint for the next call.
    let paid_until = daily
        .filter(|daily| !daily.is_zero())
        .and_then(|daily| increment.checked_mul(MICROS_PER_DAY)?.checked_div(daily))
        .and_then(|micros| micros.ceil().to_i64())
        .map(|micros| checkpoint + Duration::microseconds(micros))
        .filter(|paid_until| *paid_until <= now);

    Accrual {
        increment,
        checkpoint: match paid_until {
            Some(paid_until) if !capped => paid_until,
            _ => now,
        },
        capped,
    }
}

/// Settle `session` up to `now` inside `tx`.
///
/// Credits the increment, advances the checkpoint and deactivates a capped
/// session. Returns the credited amount.
pub(crate) async fn settle(
    tx: &mut dyn LedgerTx,
    session: &mut MiningSession,
    now: DateTime<Utc>,
) -> Result<Decimal> {
    let accrual = accrue(session, now);
    let mut dirty = false;

    if accrual.increment > Decimal::ZERO {
        session.mined_amount += accrual.increment;
        tx.post(&Posting {
            account_id: session.account_id,
            asset: session.asset,
            amount: accrual.increment,
            kind: EntryKind::MiningReward,
            reference: session_reference(session.id),
            at: now,
        })
        .await?;
        dirty = true;
    }

    if accrual.checkpoint != session.checkpoint() {
        session.last_checkpoint = Some(accrual.checkpoint);
        dirty = true;
    }

    if accrual.capped && session.is_active {
        session.is_active = false;
        dirty = true;
        info!(
            session_id = session.id,
            account_id = session.account_id,
            mined = %session.mined_amount,
            "Mining session reached its cap"
        );
    }

    if dirty {
        tx.update_session(session).await?;
    }
    Ok(accrual.increment)
}

/// Ledger reference recorded on mining reward entries.
pub fn session_reference(id: SessionId) -> String {
    format!("mining_session:{id}")
}

/// Settled view of a session, returned by [`AccrualEngine::live_progress`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiningProgress {
    pub session_id: SessionId,
    pub asset: Asset,
    pub deposited_amount: Decimal,
    pub rate: Decimal,
    pub mined_amount: Decimal,
    pub cap: Decimal,
    pub remaining: Decimal,
    /// Reward per second at the session's rate, unfloored.
    pub per_second: Decimal,
    /// Display-only percentage of the cap mined so far.
    pub percent: f64,
    pub is_active: bool,
    pub is_paused: bool,
    /// Amount credited by the settlement that produced this view.
    pub credited: Decimal,
}

impl MiningProgress {
    fn from_session(session: &MiningSession, credited: Decimal) -> Self {
        let cap = session.cap();
        let percent = if cap.is_zero() {
            0.0
        } else {
            (session.mined_amount / cap * dec!(100))
                .to_f64()
                .unwrap_or(0.0)
        };
        Self {
            session_id: session.id,
            asset: session.asset,
            deposited_amount: session.deposited_amount,
            rate: session.rate,
            mined_amount: session.mined_amount,
            cap,
            remaining: (cap - session.mined_amount).max(Decimal::ZERO),
            per_second: session.deposited_amount * session.rate / SECONDS_PER_DAY,
            percent,
            is_active: session.is_active,
            is_paused: session.is_paused,
            credited,
        }
    }
}

/// Summary of one sweep over the accruing sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub credited: usize,
    pub failed: usize,
}

/// Runs accrual against the ledger store.
#[derive(Clone)]
pub struct AccrualEngine {
    store: Arc<dyn LedgerStore>,
}

impl AccrualEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Settle one session up to `now` in its own unit of work.
    pub async fn accrue_session(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<Decimal> {
        let credited = with_conflict_retry("accrue_session", move || {
            self.settle_once(session_id, now)
        })
        .await?
        .1;
        if credited > Decimal::ZERO {
            debug!(session_id, %credited, "Accrued mining reward");
        }
        Ok(credited)
    }

    /// Settle the session and report its progress.
    ///
    /// The returned figures are exactly what was persisted.
    pub async fn live_progress(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<MiningProgress> {
        let (session, credited) =
            with_conflict_retry("live_progress", move || self.settle_once(session_id, now)).await?;
        Ok(MiningProgress::from_session(&session, credited))
    }

    async fn settle_once(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<(MiningSession, Decimal)> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(tx.as_mut(), session_id).await?;
        let credited = settle(tx.as_mut(), &mut session, now).await?;
        tx.commit().await?;
        Ok((session, credited))
    }

    /// Settle every active, unpaused session, `batch_size` ids per page.
    ///
    /// Each session settles in its own unit of work; a failure is logged and
    /// retried on the next sweep.
    pub async fn sweep(&self, now: DateTime<Utc>, batch_size: u64) -> Result<SweepReport> {
        let batch_size = batch_size.max(1);
        let mut report = SweepReport::default();
        let mut after: SessionId = 0;

        loop {
            let ids = {
                let mut tx = self.store.begin().await?;
                tx.accruing_sessions(after, batch_size).await?
            };

            for &id in &ids {
                report.scanned += 1;
                match self.accrue_session(id, now).await {
                    Ok(credited) if credited > Decimal::ZERO => report.credited += 1,
                    Ok(_) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(session_id = id, error = %e, "Accrual failed; will retry next sweep");
                    }
                }
            }

            match ids.last() {
                Some(&last) if ids.len() as u64 == batch_size => after = last,
                _ => break,
            }
        }

        info!(
            scanned = report.scanned,
            credited = report.credited,
            failed = report.failed,
            "Accrual sweep complete"
        );
        Ok(report)
    }

    /// Settle up to `now`, then stop accrual until resumed.
    pub async fn pause_session(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<MiningSession> {
        with_conflict_retry("pause_session", move || self.pause_once(session_id, now)).await
    }

    async fn pause_once(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<MiningSession> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(tx.as_mut(), session_id).await?;
        if session.is_paused {
            return Ok(session);
        }

        settle(tx.as_mut(), &mut session, now).await?;
        session.is_paused = true;
        tx.update_session(&session).await?;
        tx.commit().await?;

        info!(session_id, "Mining session paused");
        Ok(session)
    }

    /// Resume a paused session. Paused time earns nothing.
    pub async fn resume_session(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<MiningSession> {
        with_conflict_retry("resume_session", move || self.resume_once(session_id, now)).await
    }

    async fn resume_once(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<MiningSession> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(tx.as_mut(), session_id).await?;
        if !session.is_active {
            return Err(LedgerError::InvalidState(format!(
                "mining session {session_id} is no longer active"
            )));
        }
        let held = tx
            .account(session.account_id)
            .await?
            .is_some_and(|account| account.mining_paused);
        if held {
            return Err(LedgerError::InvalidState(format!(
                "mining is paused for account {}",
                session.account_id
            )));
        }
        if !session.is_paused {
            return Ok(session);
        }

        session.is_paused = false;
        session.last_checkpoint = Some(now);
        tx.update_session(&session).await?;
        tx.commit().await?;

        info!(session_id, "Mining session resumed");
        Ok(session)
    }

    /// Settle and pause every active session of the account, and hold
    /// sessions started later until [`resume_account`](Self::resume_account).
    /// Returns the number of sessions paused.
    pub async fn pause_account(&self, account_id: AccountId, now: DateTime<Utc>) -> Result<usize> {
        let paused = with_conflict_retry("pause_account", move || {
            self.hold_account_once(account_id, true, now)
        })
        .await?;
        info!(account_id, sessions = paused, "Mining paused for account");
        Ok(paused)
    }

    /// Lift the account hold and resume every active paused session.
    /// Paused time earns nothing. Returns the number of sessions resumed.
    pub async fn resume_account(&self, account_id: AccountId, now: DateTime<Utc>) -> Result<usize> {
        let resumed = with_conflict_retry("resume_account", move || {
            self.hold_account_once(account_id, false, now)
        })
        .await?;
        info!(account_id, sessions = resumed, "Mining resumed for account");
        Ok(resumed)
    }

    async fn hold_account_once(&self, account_id: AccountId, hold: bool, now: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.store.begin().await?;
        let mut account = tx
            .account(account_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("account", account_id))?;

        let mut changed = 0;
        for mut session in tx.sessions_for(account_id).await? {
            if !session.is_active || session.is_paused == hold {
                continue;
            }
            if hold {
                settle(tx.as_mut(), &mut session, now).await?;
                // The cap may have been reached while settling.
                if !session.is_active {
                    continue;
                }
            } else {
                session.last_checkpoint = Some(now);
            }
            session.is_paused = hold;
            tx.update_session(&session).await?;
            changed += 1;
        }

        account.mining_paused = hold;
        tx.update_account(&account).await?;
        tx.append_audit(&NewAudit::new(
            if hold { "MINING_PAUSED" } else { "MINING_RESUMED" },
            Some(account_id),
            format!(
                "Mining {} for {} ({changed} sessions).",
                if hold { "paused" } else { "resumed" },
                account.email
            ),
            now,
        ))
        .await?;
        tx.commit().await?;
        Ok(changed)
    }
}

async fn load_session(tx: &mut dyn LedgerTx, session_id: SessionId) -> Result<MiningSession> {
    tx.session(session_id)
        .await?
        .ok_or_else(|| LedgerError::not_found("mining session", session_id))
}
