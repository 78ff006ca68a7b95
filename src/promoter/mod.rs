//! Pending-to-spendable promotion.
//!
//! Completion rewards wait in the pending ledger for a cooldown so a provider
//! reversal can still reduce them. Once an entry is older than the cooldown
//! and still `pending`, its amount is posted to the spendable points balance
//! and the entry is retired as `cleared`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::asset::Asset;
use crate::error::Result;
use crate::model::{AccountId, EntryKind, PendingId, PendingPoint, PendingStatus, Posting};
use crate::storage::LedgerStore;
use crate::utils::retry::with_conflict_retry;

/// Summary of one promotion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub promoted: usize,
    /// Entries that were no longer promotable when their unit of work ran.
    pub skipped: usize,
    pub failed: usize,
    pub total: Decimal,
}

/// Ledger reference recorded on promotion entries.
pub fn pending_reference(id: PendingId) -> String {
    format!("pending:{id}")
}

#[derive(Clone)]
pub struct PendingPromoter {
    store: Arc<dyn LedgerStore>,
    cooldown: Duration,
}

impl PendingPromoter {
    pub fn new(store: Arc<dyn LedgerStore>, cooldown_secs: u64) -> Self {
        Self {
            store,
            cooldown: Duration::seconds(cooldown_secs.min(u64::from(u32::MAX)) as i64),
        }
    }

    /// Promote every entry earned at or before `now - cooldown`.
    ///
    /// Each entry is promoted in its own unit of work so one failure does not
    /// hold back the rest; failed entries stay `pending` for the next pass.
    pub async fn promote_due(&self, now: DateTime<Utc>, batch_size: u64) -> Result<PromotionReport> {
        let batch_size = batch_size.max(1);
        let cutoff = now - self.cooldown;
        let mut report = PromotionReport::default();

        loop {
            let due = {
                let mut tx = self.store.begin().await?;
                tx.due_pending(cutoff, batch_size).await?
            };
            let mut progressed = false;

            for entry in &due {
                match with_conflict_retry("promote_pending", || self.promote_once(entry, now)).await {
                    Ok(Some(amount)) => {
                        progressed = true;
                        report.promoted += 1;
                        report.total += amount;
                    }
                    Ok(None) => {
                        progressed = true;
                        report.skipped += 1;
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(pending_id = entry.id, account_id = entry.account_id, error = %e, "Promotion failed");
                    }
                }
            }

            if (due.len() as u64) < batch_size || !progressed {
                break;
            }
        }

        if report.promoted > 0 || report.failed > 0 {
            info!(
                promoted = report.promoted,
                skipped = report.skipped,
                failed = report.failed,
                total = %report.total,
                "Pending promotion complete"
            );
        }
        Ok(report)
    }

    /// Returns the promoted amount, or `None` if the entry changed since it
    /// was selected.
    async fn promote_once(&self, selected: &PendingPoint, now: DateTime<Utc>) -> Result<Option<Decimal>> {
        let mut tx = self.store.begin().await?;

        let current = tx
            .pending_for(selected.account_id)
            .await?
            .into_iter()
            .find(|p| p.id == selected.id && p.status == PendingStatus::Pending);
        let Some(mut entry) = current else {
            return Ok(None);
        };

        if entry.amount > Decimal::ZERO {
            tx.post(&Posting {
                account_id: entry.account_id,
                asset: Asset::Points,
                amount: entry.amount,
                kind: EntryKind::PendingCleared,
                reference: pending_reference(entry.id),
                at: now,
            })
            .await?;
        }

        entry.status = PendingStatus::Cleared;
        entry.resolved_at = Some(now);
        tx.update_pending(&entry).await?;
        tx.commit().await?;

        debug!(pending_id = entry.id, account_id = entry.account_id, amount = %entry.amount, "Pending reward promoted");
        Ok(Some(entry.amount))
    }

    /// Sum of `pending` entries for an account.
    pub async fn pending_balance(&self, account_id: AccountId) -> Result<Decimal> {
        let mut tx = self.store.begin().await?;
        Ok(tx
            .pending_for(account_id)
            .await?
            .iter()
            .filter(|p| p.status == PendingStatus::Pending)
            .map(|p| p.amount)
            .sum())
    }
}

#[cfg(test)]
mod tests;
