//! First-party pending credits: in-house surveys, referral bonuses and
//! manual adjustments. They go through the same pending ledger as provider
//! webhooks, so chargeback netting and the promotion cooldown apply.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use super::{load_account, validate_amount};
use crate::asset::Asset;
use crate::error::{LedgerError, Result};
use crate::model::{AccountId, NewAudit, PendingPoint};
use crate::storage::LedgerStore;
use crate::utils::retry::with_conflict_retry;
use crate::webhook::reconcile::{record_completion, CompletionEffect};

#[derive(Clone)]
pub struct RewardService {
    store: Arc<dyn LedgerStore>,
}

impl RewardService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Credit `amount` points from `source` as pending.
    pub async fn credit_pending(
        &self,
        account_id: AccountId,
        source: &str,
        external_ref: Option<&str>,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<CompletionEffect> {
        validate_amount(Asset::Points, amount)?;
        if source.trim().is_empty() {
            return Err(LedgerError::InvalidState("pending credit needs a source".to_string()));
        }

        let effect = with_conflict_retry("credit_pending", move || {
            self.credit_once(account_id, source, external_ref, amount, now)
        })
        .await?;
        info!(account_id, source, %amount, netted = %effect.netted, "Pending reward credited");
        Ok(effect)
    }

    async fn credit_once(
        &self,
        account_id: AccountId,
        source: &str,
        external_ref: Option<&str>,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<CompletionEffect> {
        let mut tx = self.store.begin().await?;
        load_account(tx.as_mut(), account_id).await?;
        let effect = record_completion(tx.as_mut(), account_id, source, external_ref, amount, now).await?;
        tx.append_audit(&NewAudit::new(
            "PENDING_CREDIT",
            Some(account_id),
            format!("{amount} points from {source} added to pending balance."),
            now,
        ))
        .await?;
        tx.commit().await?;
        Ok(effect)
    }

    /// Every pending-ledger row for the account, oldest first.
    pub async fn pending_entries(&self, account_id: AccountId) -> Result<Vec<PendingPoint>> {
        let mut tx = self.store.begin().await?;
        load_account(tx.as_mut(), account_id).await?;
        Ok(tx.pending_for(account_id).await?)
    }
}
