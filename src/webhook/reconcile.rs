//! Pending-balance effects of completions and reversals.
//!
//! These run inside the caller's unit of work. Spendable balances are never
//! touched here: a completion adds a pending entry (after netting any
//! outstanding negative entries from the same source) and a reversal reduces
//! the matching pending entry or records a negative one.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::Result;
use crate::model::{AccountId, NewPending, PendingPoint, PendingStatus};
use crate::storage::LedgerTx;

/// What a completion did to the pending ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionEffect {
    /// New pending entry, absent when netting absorbed the whole amount.
    pub pending: Option<PendingPoint>,
    /// Amount used to settle earlier chargebacks.
    pub netted: Decimal,
}

/// What a reversal did to the pending ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ReversalEffect {
    pub deducted: Decimal,
    /// Whether an open pending entry was found and reduced.
    pub matched: bool,
    /// Status of the affected entry afterwards.
    pub status: Option<PendingStatus>,
}

/// Record `amount` earned from `source` as pending.
pub async fn record_completion(
    tx: &mut dyn LedgerTx,
    account_id: AccountId,
    source: &str,
    external_ref: Option<&str>,
    amount: Decimal,
    now: DateTime<Utc>,
) -> Result<CompletionEffect> {
    if amount <= Decimal::ZERO {
        return Ok(CompletionEffect {
            pending: None,
            netted: Decimal::ZERO,
        });
    }

    let mut remaining = amount;
    for mut debt in tx.negative_pending(account_id, source).await? {
        if remaining.is_zero() {
            break;
        }
        let absorbed = remaining.min(-debt.amount);
        if absorbed <= Decimal::ZERO {
            continue;
        }
        debt.amount += absorbed;
        remaining -= absorbed;
        if debt.amount.is_zero() {
            debt.status = PendingStatus::ChargebackDeducted;
            debt.resolved_at = Some(now);
        }
        tx.update_pending(&debt).await?;
        debug!(pending_id = debt.id, %absorbed, "Netted completion against chargeback");
    }

    let pending = if remaining > Decimal::ZERO {
        Some(
            tx.insert_pending(&NewPending {
                account_id,
                amount: remaining,
                source: source.to_string(),
                external_ref: external_ref.map(str::to_string),
                earned_at: now,
                status: PendingStatus::Pending,
            })
            .await?,
        )
    } else {
        None
    };

    Ok(CompletionEffect {
        pending,
        netted: amount - remaining,
    })
}

/// Apply a reversal of `amount` against the entry earned as `external_ref`.
///
/// A zero `amount` cancels the matched entry in full. Without a match the
/// amount becomes a `negative_pending` entry, netted against later earnings
/// from the same source.
pub async fn record_reversal(
    tx: &mut dyn LedgerTx,
    account_id: AccountId,
    source: &str,
    external_ref: Option<&str>,
    amount: Decimal,
    now: DateTime<Utc>,
) -> Result<ReversalEffect> {
    let open = match external_ref {
        Some(reference) => tx.open_pending(account_id, source, reference).await?,
        None => None,
    };

    if let Some(mut entry) = open {
        let deducted = if amount > Decimal::ZERO {
            amount
        } else {
            entry.amount
        };
        entry.amount -= deducted;
        if entry.amount.is_zero() {
            entry.status = PendingStatus::ChargebackDeducted;
            entry.resolved_at = Some(now);
        } else if entry.amount < Decimal::ZERO {
            entry.status = PendingStatus::NegativePending;
        }
        tx.update_pending(&entry).await?;
        return Ok(ReversalEffect {
            deducted,
            matched: true,
            status: Some(entry.status),
        });
    }

    if amount <= Decimal::ZERO {
        return Ok(ReversalEffect {
            deducted: Decimal::ZERO,
            matched: false,
            status: None,
        });
    }

    let entry = tx
        .insert_pending(&NewPending {
            account_id,
            amount: -amount,
            source: source.to_string(),
            external_ref: external_ref.map(str::to_string),
            earned_at: now,
            status: PendingStatus::NegativePending,
        })
        .await?;

    Ok(ReversalEffect {
        deducted: amount,
        matched: false,
        status: Some(entry.status),
    })
}
