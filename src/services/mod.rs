//! Account-facing ledger operations.
//!
//! Each service owns a handle to the ledger store and runs every operation
//! as one committed unit of work. [`LedgerServices`] wires all of them from a
//! single [`Config`].

pub mod accounts;
pub mod deposits;
pub mod history;
pub mod payouts;
pub mod rewards;
pub mod settings;
pub mod transfers;

use std::sync::Arc;

use rust_decimal::Decimal;

pub use accounts::AccountService;
pub use deposits::DepositService;
pub use history::{HistoryQuery, HistoryService, TransactionSummary};
pub use payouts::PayoutService;
pub use rewards::RewardService;
pub use transfers::{TransferReceipt, TransferService};

use crate::accrual::AccrualEngine;
use crate::asset::Asset;
use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::fraud::FraudEngine;
use crate::model::{Account, AccountId, AccountStatus};
use crate::promoter::PendingPromoter;
use crate::ratelimit::RateLimiter;
use crate::storage::{LedgerStore, LedgerTx};
use crate::webhook::WebhookEngine;

/// Every engine and service over one store.
#[derive(Clone)]
pub struct LedgerServices {
    pub accounts: AccountService,
    pub deposits: DepositService,
    pub transfers: TransferService,
    pub payouts: PayoutService,
    pub rewards: RewardService,
    pub history: HistoryService,
    pub accrual: AccrualEngine,
    pub webhooks: WebhookEngine,
    pub promoter: PendingPromoter,
    pub fraud: FraudEngine,
    pub limiter: RateLimiter,
}

impl LedgerServices {
    pub fn new(store: Arc<dyn LedgerStore>, config: &Config) -> Self {
        let fraud = FraudEngine::new(store.clone());
        let limiter = RateLimiter::new(store.clone(), &config.rate_limit);
        Self {
            accounts: AccountService::new(
                store.clone(),
                fraud.clone(),
                limiter.clone(),
                config.ledger.referral.clone(),
            ),
            deposits: DepositService::new(store.clone(), config.ledger.clone()),
            transfers: TransferService::new(store.clone()),
            payouts: PayoutService::new(store.clone(), config.ledger.clone()),
            rewards: RewardService::new(store.clone()),
            history: HistoryService::new(store.clone()),
            accrual: AccrualEngine::new(store.clone()),
            webhooks: WebhookEngine::new(
                store.clone(),
                config.ledger.clone(),
                config.providers.clone(),
            ),
            promoter: PendingPromoter::new(store, config.ledger.pending_cooldown_secs),
            fraud,
            limiter,
        }
    }
}

pub(crate) async fn load_account(tx: &mut dyn LedgerTx, account_id: AccountId) -> Result<Account> {
    tx.account(account_id)
        .await?
        .ok_or_else(|| LedgerError::not_found("account", account_id))
}

/// Refuse accounts that may not move funds.
pub(crate) fn ensure_can_move_funds(account: &Account) -> Result<()> {
    if account.is_flagged {
        return Err(LedgerError::AccountFlagged(account.id));
    }
    if account.status != AccountStatus::Approved {
        return Err(LedgerError::AccountInactive {
            account_id: account.id,
            status: account.status.to_string(),
        });
    }
    Ok(())
}

/// Reject non-positive amounts and amounts finer than the asset's unit.
pub(crate) fn validate_amount(asset: Asset, amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO || asset.floor(amount) != amount {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

/// Fail with `InsufficientBalance` unless `amount` is available.
pub(crate) async fn ensure_balance(
    tx: &mut dyn LedgerTx,
    account_id: AccountId,
    asset: Asset,
    amount: Decimal,
) -> Result<()> {
    let available = tx.balance(account_id, asset).await?;
    if available < amount {
        return Err(LedgerError::InsufficientBalance {
            asset,
            available,
            requested: amount,
        });
    }
    Ok(())
}
