//! Deposit lifecycle and mining session creation.
//!
//! A deposit moves `pending -> submitted -> confirmed` (or `rejected`).
//! Confirmation credits the deposit and opens a mining session at the
//! account's personal rate, or the global rate when none is set.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use super::settings::{decimal_setting, GLOBAL_MINING_RATE};
use super::{ensure_can_move_funds, load_account, validate_amount};
use crate::asset::Asset;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::model::{
    Account, AccountId, Deposit, DepositId, DepositStatus, EntryKind, MiningSession, NewAudit,
    NewDeposit, NewSession, Posting,
};
use crate::storage::{LedgerStore, LedgerTx};
use crate::utils::retry::with_conflict_retry;

/// Ledger reference recorded on deposit entries.
pub fn deposit_reference(id: DepositId) -> String {
    format!("deposit:{id}")
}

fn validate_rate(rate: Decimal) -> Result<()> {
    if rate <= Decimal::ZERO || rate > Decimal::ONE {
        return Err(LedgerError::InvalidRate(rate));
    }
    Ok(())
}

#[derive(Clone)]
pub struct DepositService {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl DepositService {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Open a deposit of a crypto asset, valued in USD at the configured quote.
    pub async fn create_deposit(
        &self,
        account_id: AccountId,
        asset: Asset,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Deposit> {
        if !asset.is_crypto() {
            return Err(LedgerError::InvalidState(format!("{asset} cannot be deposited")));
        }
        validate_amount(asset, amount)?;
        let usd_value = amount
            .checked_mul(self.config.usd_quote(asset))
            .ok_or(LedgerError::InvalidAmount(amount))?
            .round_dp(2);

        let mut tx = self.store.begin().await?;
        let account = load_account(tx.as_mut(), account_id).await?;
        ensure_can_move_funds(&account)?;

        let deposit = tx
            .insert_deposit(&NewDeposit {
                account_id,
                asset,
                amount,
                usd_value,
                created_at: now,
            })
            .await?;
        tx.commit().await?;

        info!(deposit_id = deposit.id, account_id, asset = %asset, %amount, "Deposit created");
        Ok(deposit)
    }

    /// Attach the user's transfer proof.
    pub async fn submit_deposit(&self, deposit_id: DepositId, proof: &str, now: DateTime<Utc>) -> Result<Deposit> {
        let mut tx = self.store.begin().await?;
        let mut deposit = load_deposit(tx.as_mut(), deposit_id).await?;
        transition(&mut deposit, DepositStatus::Submitted, now)?;
        deposit.proof = Some(proof.to_string());
        tx.update_deposit(&deposit).await?;
        tx.commit().await?;
        Ok(deposit)
    }

    /// Confirm the deposit, credit it and start mining.
    pub async fn confirm_deposit(&self, deposit_id: DepositId, now: DateTime<Utc>) -> Result<(Deposit, MiningSession)> {
        let (deposit, session) =
            with_conflict_retry("confirm_deposit", move || self.confirm_once(deposit_id, now)).await?;
        info!(
            deposit_id,
            session_id = session.id,
            account_id = deposit.account_id,
            rate = %session.rate,
            "Deposit confirmed; mining session started"
        );
        Ok((deposit, session))
    }

    async fn confirm_once(&self, deposit_id: DepositId, now: DateTime<Utc>) -> Result<(Deposit, MiningSession)> {
        let mut tx = self.store.begin().await?;
        let mut deposit = load_deposit(tx.as_mut(), deposit_id).await?;
        transition(&mut deposit, DepositStatus::Confirmed, now)?;
        let account = load_account(tx.as_mut(), deposit.account_id).await?;

        tx.update_deposit(&deposit).await?;
        tx.post(&Posting {
            account_id: deposit.account_id,
            asset: deposit.asset,
            amount: deposit.amount,
            kind: EntryKind::Deposit,
            reference: deposit_reference(deposit.id),
            at: now,
        })
        .await?;

        let rate = self.mining_rate(tx.as_mut(), &account).await?;
        let mut session = tx
            .insert_session(&NewSession {
                account_id: deposit.account_id,
                deposit_id: deposit.id,
                asset: deposit.asset,
                deposited_amount: deposit.amount,
                rate,
                created_at: now,
            })
            .await?;
        if account.mining_paused {
            session.is_paused = true;
            tx.update_session(&session).await?;
        }
        tx.append_audit(&NewAudit::new(
            "DEPOSIT_CONFIRMED",
            Some(deposit.account_id),
            format!(
                "Deposit {} of {} {} confirmed; mining at {rate} per day.",
                deposit.id, deposit.amount, deposit.asset
            ),
            now,
        ))
        .await?;
        tx.commit().await?;
        Ok((deposit, session))
    }

    pub async fn reject_deposit(&self, deposit_id: DepositId, now: DateTime<Utc>) -> Result<Deposit> {
        let mut tx = self.store.begin().await?;
        let mut deposit = load_deposit(tx.as_mut(), deposit_id).await?;
        transition(&mut deposit, DepositStatus::Rejected, now)?;
        tx.update_deposit(&deposit).await?;
        tx.commit().await?;

        info!(deposit_id, account_id = deposit.account_id, "Deposit rejected");
        Ok(deposit)
    }

    /// Set or clear the account's personal mining rate. Applies to sessions
    /// created afterwards.
    pub async fn set_personal_rate(
        &self,
        account_id: AccountId,
        rate: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<Account> {
        if let Some(rate) = rate {
            validate_rate(rate)?;
        }

        let mut tx = self.store.begin().await?;
        let mut account = load_account(tx.as_mut(), account_id).await?;
        account.personal_rate = rate;
        tx.update_account(&account).await?;
        tx.append_audit(&NewAudit::new(
            "PERSONAL_RATE",
            Some(account_id),
            match rate {
                Some(rate) => format!("Personal mining rate set to {rate}."),
                None => "Personal mining rate cleared.".to_string(),
            },
            now,
        ))
        .await?;
        tx.commit().await?;
        Ok(account)
    }

    async fn mining_rate(&self, tx: &mut dyn LedgerTx, account: &Account) -> Result<Decimal> {
        let rate = match account.personal_rate {
            Some(rate) => rate,
            None => decimal_setting(tx, GLOBAL_MINING_RATE, self.config.global_mining_rate).await?,
        };
        validate_rate(rate)?;
        Ok(rate)
    }
}

fn transition(deposit: &mut Deposit, next: DepositStatus, now: DateTime<Utc>) -> Result<()> {
    if !deposit.status.can_transition_to(next) {
        return Err(LedgerError::InvalidState(format!(
            "deposit {} cannot move from {} to {next}",
            deposit.id, deposit.status
        )));
    }
    deposit.status = next;
    deposit.updated_at = now;
    Ok(())
}

async fn load_deposit(tx: &mut dyn LedgerTx, deposit_id: DepositId) -> Result<Deposit> {
    tx.deposit(deposit_id)
        .await?
        .ok_or_else(|| LedgerError::not_found("deposit", deposit_id))
}
