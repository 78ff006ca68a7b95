//! Withdrawals and point redemptions.
//!
//! Funds are debited when the request is created and refunded if an admin
//! rejects it; approval only records the decision.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use super::settings::{conversion_rate, POINT_TO_BTC_RATE, POINT_TO_GIFT_RATE};
use super::{ensure_balance, ensure_can_move_funds, load_account, validate_amount};
use crate::asset::Asset;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::model::{
    AccountId, EntryKind, NewAudit, NewPayout, PayoutId, PayoutKind, PayoutRequest, PayoutStatus,
    Posting,
};
use crate::storage::{LedgerStore, LedgerTx};
use crate::utils::retry::with_conflict_retry;

/// Ledger reference recorded on payout and refund entries.
pub fn payout_reference(id: PayoutId) -> String {
    format!("payout:{id}")
}

#[derive(Clone)]
pub struct PayoutService {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl PayoutService {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Request a crypto withdrawal to `address`.
    pub async fn request_withdrawal(
        &self,
        account_id: AccountId,
        asset: Asset,
        amount: Decimal,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest> {
        if !asset.is_crypto() {
            return Err(LedgerError::InvalidState(format!("{asset} cannot be withdrawn")));
        }
        if address.trim().is_empty() {
            return Err(LedgerError::InvalidState("withdrawal address is required".to_string()));
        }
        validate_amount(asset, amount)?;

        let request = NewPayout {
            account_id,
            kind: PayoutKind::Withdrawal,
            asset,
            amount,
            value: amount,
            destination: Some(address.trim().to_string()),
            created_at: now,
        };
        with_conflict_retry("request_withdrawal", || self.debit_once(&request, EntryKind::Withdrawal)).await
    }

    /// Redeem points for BTC or a gift card at the current conversion setting.
    pub async fn request_redemption(
        &self,
        account_id: AccountId,
        kind: PayoutKind,
        points: Decimal,
        destination: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest> {
        validate_amount(Asset::Points, points)?;
        with_conflict_retry("request_redemption", move || {
            self.redeem_once(account_id, kind, points, destination, now)
        })
        .await
    }

    async fn redeem_once(
        &self,
        account_id: AccountId,
        kind: PayoutKind,
        points: Decimal,
        destination: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest> {
        let (key, fallback, value_scale) = match kind {
            PayoutKind::BtcRedemption => (POINT_TO_BTC_RATE, &self.config.point_to_btc_rate, Asset::Bitcoin),
            PayoutKind::GiftCardRedemption => {
                (POINT_TO_GIFT_RATE, &self.config.point_to_gift_rate, Asset::Points)
            }
            PayoutKind::Withdrawal => {
                return Err(LedgerError::InvalidState(
                    "withdrawals are requested with request_withdrawal".to_string(),
                ))
            }
        };

        let rate = {
            let mut tx = self.store.begin().await?;
            conversion_rate(tx.as_mut(), key, fallback).await?
        };
        let value = points
            .checked_mul(rate)
            .map(|value| value_scale.floor(value))
            .filter(|value| *value > Decimal::ZERO)
            .ok_or(LedgerError::InvalidAmount(points))?;

        let request = NewPayout {
            account_id,
            kind,
            asset: Asset::Points,
            amount: points,
            value,
            destination: destination.map(str::to_string),
            created_at: now,
        };
        self.debit_once(&request, EntryKind::Redemption).await
    }

    async fn debit_once(&self, request: &NewPayout, kind: EntryKind) -> Result<PayoutRequest> {
        let mut tx = self.store.begin().await?;
        let account = load_account(tx.as_mut(), request.account_id).await?;
        ensure_can_move_funds(&account)?;
        if request.kind == PayoutKind::Withdrawal && account.withdrawals_suspended {
            return Err(LedgerError::WithdrawalsSuspended(account.id));
        }
        ensure_balance(tx.as_mut(), account.id, request.asset, request.amount).await?;

        let payout = tx.insert_payout(request).await?;
        tx.post(&Posting {
            account_id: account.id,
            asset: request.asset,
            amount: -request.amount,
            kind,
            reference: payout_reference(payout.id),
            at: request.created_at,
        })
        .await?;
        tx.append_audit(&NewAudit::new(
            "PAYOUT_REQUESTED",
            Some(account.id),
            format!(
                "{} request {} for {} {} (value {}).",
                payout.kind, payout.id, payout.amount, payout.asset, payout.value
            ),
            request.created_at,
        ))
        .await?;
        tx.commit().await?;

        info!(payout_id = payout.id, account_id = account.id, kind = %payout.kind, amount = %payout.amount, "Payout requested");
        Ok(payout)
    }

    pub async fn approve_payout(&self, payout_id: PayoutId, now: DateTime<Utc>) -> Result<PayoutRequest> {
        with_conflict_retry("approve_payout", move || self.decide_once(payout_id, PayoutStatus::Approved, now)).await
    }

    /// Reject a pending payout and refund the debited amount.
    pub async fn reject_payout(&self, payout_id: PayoutId, now: DateTime<Utc>) -> Result<PayoutRequest> {
        with_conflict_retry("reject_payout", move || self.decide_once(payout_id, PayoutStatus::Rejected, now)).await
    }

    async fn decide_once(&self, payout_id: PayoutId, decision: PayoutStatus, now: DateTime<Utc>) -> Result<PayoutRequest> {
        let mut tx = self.store.begin().await?;
        let mut payout = load_payout(tx.as_mut(), payout_id).await?;
        if payout.status != PayoutStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "payout {payout_id} is already {}",
                payout.status
            )));
        }

        payout.status = decision;
        payout.updated_at = now;
        tx.update_payout(&payout).await?;
        if decision == PayoutStatus::Rejected {
            tx.post(&Posting {
                account_id: payout.account_id,
                asset: payout.asset,
                amount: payout.amount,
                kind: EntryKind::PayoutRefund,
                reference: payout_reference(payout.id),
                at: now,
            })
            .await?;
        }
        tx.append_audit(&NewAudit::new(
            "PAYOUT_DECIDED",
            Some(payout.account_id),
            format!("{} request {} {decision}.", payout.kind, payout.id),
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(payout_id, account_id = payout.account_id, status = %decision, "Payout decided");
        Ok(payout)
    }
}

async fn load_payout(tx: &mut dyn LedgerTx, payout_id: PayoutId) -> Result<PayoutRequest> {
    tx.payout(payout_id)
        .await?
        .ok_or_else(|| LedgerError::not_found("payout", payout_id))
}
