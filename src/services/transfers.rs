//! Account-to-account transfers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use super::{ensure_balance, ensure_can_move_funds, load_account, validate_amount};
use crate::asset::Asset;
use crate::error::{LedgerError, Result};
use crate::model::{AccountId, EntryKind, LedgerEntry, NewAudit, Posting};
use crate::storage::LedgerStore;
use crate::utils::retry::with_conflict_retry;

/// Both sides of a completed transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReceipt {
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
}

#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn LedgerStore>,
}

impl TransferService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Move `amount` of `asset` from `from` to the account registered as
    /// `to_email`. Both postings commit together.
    pub async fn transfer(
        &self,
        from: AccountId,
        to_email: &str,
        asset: Asset,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<TransferReceipt> {
        validate_amount(asset, amount)?;
        let receipt = with_conflict_retry("transfer", move || {
            self.transfer_once(from, to_email, asset, amount, now)
        })
        .await?;
        info!(
            from,
            to = receipt.credit.account_id,
            asset = %asset,
            %amount,
            "Transfer completed"
        );
        Ok(receipt)
    }

    async fn transfer_once(
        &self,
        from: AccountId,
        to_email: &str,
        asset: Asset,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<TransferReceipt> {
        let mut tx = self.store.begin().await?;
        let sender = load_account(tx.as_mut(), from).await?;
        ensure_can_move_funds(&sender)?;

        let recipient = tx
            .account_by_email(to_email.trim())
            .await?
            .ok_or_else(|| LedgerError::not_found("account", to_email))?;
        if recipient.id == sender.id {
            return Err(LedgerError::SelfTransfer);
        }

        ensure_balance(tx.as_mut(), sender.id, asset, amount).await?;
        let reference = format!("transfer:{}:{}", sender.id, recipient.id);
        let debit = tx
            .post(&Posting {
                account_id: sender.id,
                asset,
                amount: -amount,
                kind: EntryKind::TransferOut,
                reference: reference.clone(),
                at: now,
            })
            .await?;
        let credit = tx
            .post(&Posting {
                account_id: recipient.id,
                asset,
                amount,
                kind: EntryKind::TransferIn,
                reference,
                at: now,
            })
            .await?;
        tx.append_audit(&NewAudit::new(
            "TRANSFER",
            Some(sender.id),
            format!("Transferred {amount} {asset} to {}.", recipient.email),
            now,
        ))
        .await?;
        tx.commit().await?;

        Ok(TransferReceipt { debit, credit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountStatus, EntryKind, NewAccount, Role};
    use crate::storage::MemoryLedgerStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn setup() -> (TransferService, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut tx = store.begin().await.unwrap();
        for email in ["alice@example.com", "bob@example.com"] {
            tx.insert_account(&NewAccount {
                email: email.to_string(),
                role: Role::User,
                status: AccountStatus::Approved,
                signup_fingerprint: None,
                created_at: t0(),
            })
            .await
            .unwrap();
        }
        tx.post(&Posting {
            account_id: 1,
            asset: Asset::Bitcoin,
            amount: dec!(0.5),
            kind: EntryKind::Deposit,
            reference: "deposit:1".to_string(),
            at: t0(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
        (TransferService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_transfer_moves_funds_atomically() {
        let (transfers, store) = setup().await;

        let receipt = transfers
            .transfer(1, "Bob@Example.com", Asset::Bitcoin, dec!(0.2), t0())
            .await
            .unwrap();

        assert_eq!(receipt.debit.balance_after, dec!(0.3));
        assert_eq!(receipt.credit.balance_after, dec!(0.2));
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.balance(2, Asset::Bitcoin).await.unwrap(), dec!(0.2));
    }

    #[tokio::test]
    async fn test_transfer_refusals() {
        let (transfers, store) = setup().await;

        assert!(matches!(
            transfers.transfer(1, "alice@example.com", Asset::Bitcoin, dec!(0.1), t0()).await,
            Err(LedgerError::SelfTransfer)
        ));
        assert!(matches!(
            transfers.transfer(1, "bob@example.com", Asset::Bitcoin, dec!(1), t0()).await,
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            transfers.transfer(1, "bob@example.com", Asset::Bitcoin, dec!(-1), t0()).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            transfers.transfer(1, "nobody@example.com", Asset::Bitcoin, dec!(0.1), t0()).await,
            Err(LedgerError::NotFound { .. })
        ));

        {
            let mut tx = store.begin().await.unwrap();
            let mut alice = tx.account(1).await.unwrap().unwrap();
            alice.is_flagged = true;
            tx.update_account(&alice).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert!(matches!(
            transfers.transfer(1, "bob@example.com", Asset::Bitcoin, dec!(0.1), t0()).await,
            Err(LedgerError::AccountFlagged(1))
        ));
    }
}
