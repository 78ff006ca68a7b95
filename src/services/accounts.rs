//! Signup, referrals, login, device tracking and account review.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use super::load_account;
use super::settings::{
    bool_setting, decimal_setting, REFERRAL_REWARD_AMOUNT, REFERRAL_REWARD_ENABLED,
    REFERRER_REWARD_AMOUNT,
};
use crate::asset::Asset;
use crate::config::ReferralConfig;
use crate::error::{LedgerError, Result};
use crate::fraud::{DeviceContext, FraudEngine};
use crate::model::{
    Account, AccountId, AccountStatus, EntryKind, NewAccount, NewAudit, Posting,
    ProcessedTransaction, Role,
};
use crate::ratelimit::RateLimiter;
use crate::storage::{LedgerStore, StorageError};
use crate::utils::retry::with_conflict_retry;

/// Ledger reference recorded on both referral reward entries.
pub fn referral_reference(referee: AccountId) -> String {
    format!("referral:{referee}")
}

/// A fresh eight-character referral code.
fn new_referral_code() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase()
}

/// Rewards paid when a referred account signs up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferralPayout {
    pub referrer: AccountId,
    pub referee: AccountId,
    pub asset: Asset,
    pub referrer_amount: Decimal,
    pub referee_amount: Decimal,
}

#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn LedgerStore>,
    fraud: FraudEngine,
    limiter: RateLimiter,
    referral: ReferralConfig,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        fraud: FraudEngine,
        limiter: RateLimiter,
        referral: ReferralConfig,
    ) -> Self {
        Self {
            store,
            fraud,
            limiter,
            referral,
        }
    }

    /// Create an account awaiting review, then run the signup fraud rules.
    ///
    /// The account is committed before the rules run, so a blocked signup
    /// leaves a suspended account behind rather than nothing.
    pub async fn signup(&self, email: &str, role: Role, device: &DeviceContext, now: DateTime<Utc>) -> Result<Account> {
        self.signup_with_referral(email, role, None, device, now).await
    }

    /// [`signup`](Self::signup) naming a referrer by code.
    ///
    /// An unknown code is ignored. Referral rewards are paid only once the
    /// signup rules pass.
    pub async fn signup_with_referral(
        &self,
        email: &str,
        role: Role,
        referral_code: Option<&str>,
        device: &DeviceContext,
        now: DateTime<Utc>,
    ) -> Result<Account> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(LedgerError::InvalidState(format!("invalid email address: {email}")));
        }
        if let Some(ip) = &device.ip {
            self.limiter.check(&format!("signup:{ip}"), now).await?;
        }

        let account = {
            let mut tx = self.store.begin().await?;
            let mut account = tx
                .insert_account(&NewAccount {
                    email: email.to_string(),
                    role,
                    status: AccountStatus::Pending,
                    signup_fingerprint: device.fingerprint.clone(),
                    created_at: now,
                })
                .await
                .map_err(|e| match e {
                    StorageError::Duplicate { key, .. } => {
                        LedgerError::InvalidState(format!("email already registered: {key}"))
                    }
                    other => other.into(),
                })?;

            account.referral_code = Some(new_referral_code());
            if let Some(code) = referral_code.map(str::trim).filter(|c| !c.is_empty()) {
                match tx.account_by_referral_code(&code.to_ascii_uppercase()).await? {
                    Some(referrer) => account.referred_by = Some(referrer.id),
                    None => debug!(code, "Unknown referral code ignored"),
                }
            }
            tx.update_account(&account).await?;
            tx.append_audit(
                &NewAudit::new("SIGNUP", Some(account.id), format!("Account {email} created."), now)
                    .with_source_ip(device.ip.as_deref()),
            )
            .await?;
            tx.commit().await?;
            account
        };
        info!(account_id = account.id, "Account created");

        self.fraud.check_signup(account.id, device, now).await?;
        if account.referred_by.is_some() {
            self.pay_referral(account.id, now).await?;
        }
        self.account(account.id).await
    }

    /// Credit the referrer and the referee of `referee` once.
    ///
    /// Returns `None` when the account was not referred, rewards are
    /// disabled, or they were already paid.
    pub async fn pay_referral(&self, referee: AccountId, now: DateTime<Utc>) -> Result<Option<ReferralPayout>> {
        let payout =
            with_conflict_retry("pay_referral", move || self.pay_referral_once(referee, now)).await?;
        if let Some(payout) = &payout {
            info!(
                referrer = payout.referrer,
                referee,
                asset = %payout.asset,
                referrer_amount = %payout.referrer_amount,
                referee_amount = %payout.referee_amount,
                "Referral rewards paid"
            );
        }
        Ok(payout)
    }

    async fn pay_referral_once(&self, referee: AccountId, now: DateTime<Utc>) -> Result<Option<ReferralPayout>> {
        let mut tx = self.store.begin().await?;
        let account = load_account(tx.as_mut(), referee).await?;
        let Some(referrer) = account.referred_by else {
            return Ok(None);
        };
        if !bool_setting(tx.as_mut(), REFERRAL_REWARD_ENABLED, self.referral.enabled).await? {
            return Ok(None);
        }

        let reference = referral_reference(referee);
        let first = tx
            .mark_processed(&ProcessedTransaction {
                tx_id: reference.clone(),
                provider: "referral".to_string(),
                processed_at: now,
            })
            .await?;
        if !first {
            return Ok(None);
        }

        let asset = self.referral.asset;
        let referrer_amount = asset.floor(
            decimal_setting(tx.as_mut(), REFERRER_REWARD_AMOUNT, self.referral.referrer_amount).await?,
        );
        let referee_amount = asset.floor(
            decimal_setting(tx.as_mut(), REFERRAL_REWARD_AMOUNT, self.referral.referee_amount).await?,
        );
        for (account_id, amount) in [(referrer, referrer_amount), (referee, referee_amount)] {
            if amount > Decimal::ZERO {
                tx.post(&Posting {
                    account_id,
                    asset,
                    amount,
                    kind: EntryKind::ReferralReward,
                    reference: reference.clone(),
                    at: now,
                })
                .await?;
            }
        }
        tx.append_audit(&NewAudit::new(
            "REFERRAL_REWARD",
            Some(referee),
            format!(
                "Account {referrer} earned {referrer_amount} {asset} for referring {referee}; \
                 welcome bonus {referee_amount} {asset}."
            ),
            now,
        ))
        .await?;
        tx.commit().await?;

        Ok(Some(ReferralPayout {
            referrer,
            referee,
            asset,
            referrer_amount,
            referee_amount,
        }))
    }

    /// Accounts that signed up with `account_id`'s referral code.
    pub async fn referrals(&self, account_id: AccountId) -> Result<Vec<Account>> {
        let mut tx = self.store.begin().await?;
        load_account(tx.as_mut(), account_id).await?;
        Ok(tx.referrals_of(account_id).await?)
    }

    /// Authenticate-adjacent checks for an existing account.
    ///
    /// Suspended and rejected accounts are refused before any rule runs.
    pub async fn login(&self, email: &str, device: &DeviceContext, now: DateTime<Utc>) -> Result<Account> {
        if let Some(ip) = &device.ip {
            self.limiter.check(&format!("login:{ip}"), now).await?;
        }

        let account = {
            let mut tx = self.store.begin().await?;
            tx.account_by_email(email.trim())
                .await?
                .ok_or_else(|| LedgerError::not_found("account", email))?
        };
        if matches!(account.status, AccountStatus::Suspended | AccountStatus::Rejected) {
            return Err(LedgerError::AccountInactive {
                account_id: account.id,
                status: account.status.to_string(),
            });
        }

        self.fraud.check_login(account.id, device, now).await?;
        self.account(account.id).await
    }

    pub async fn track_device(&self, account_id: AccountId, device: &DeviceContext, now: DateTime<Utc>) -> Result<()> {
        self.fraud.track_device(account_id, device, now).await
    }

    pub async fn account(&self, account_id: AccountId) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        load_account(tx.as_mut(), account_id).await
    }

    /// Spendable balance in every asset.
    pub async fn balances(&self, account_id: AccountId) -> Result<Vec<(Asset, Decimal)>> {
        let mut tx = self.store.begin().await?;
        load_account(tx.as_mut(), account_id).await?;
        let mut balances = Vec::with_capacity(Asset::ALL.len());
        for asset in Asset::ALL {
            balances.push((asset, tx.balance(account_id, asset).await?));
        }
        Ok(balances)
    }

    pub async fn approve(&self, account_id: AccountId, now: DateTime<Utc>) -> Result<Account> {
        self.set_status(account_id, AccountStatus::Approved, now).await
    }

    pub async fn suspend(&self, account_id: AccountId, now: DateTime<Utc>) -> Result<Account> {
        self.set_status(account_id, AccountStatus::Suspended, now).await
    }

    pub async fn reject(&self, account_id: AccountId, now: DateTime<Utc>) -> Result<Account> {
        self.set_status(account_id, AccountStatus::Rejected, now).await
    }

    /// Hold every withdrawal request of the account until re-enabled.
    pub async fn suspend_withdrawals(&self, account_id: AccountId, now: DateTime<Utc>) -> Result<Account> {
        self.set_withdrawal_hold(account_id, true, now).await
    }

    pub async fn enable_withdrawals(&self, account_id: AccountId, now: DateTime<Utc>) -> Result<Account> {
        self.set_withdrawal_hold(account_id, false, now).await
    }

    async fn set_withdrawal_hold(&self, account_id: AccountId, suspended: bool, now: DateTime<Utc>) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let mut account = load_account(tx.as_mut(), account_id).await?;
        if account.withdrawals_suspended == suspended {
            return Ok(account);
        }
        account.withdrawals_suspended = suspended;
        tx.update_account(&account).await?;
        tx.append_audit(&NewAudit::new(
            if suspended {
                "WITHDRAWALS_SUSPENDED"
            } else {
                "WITHDRAWALS_ENABLED"
            },
            Some(account_id),
            format!(
                "Withdrawals {} for {}.",
                if suspended { "suspended" } else { "enabled" },
                account.email
            ),
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(account_id, suspended, "Withdrawal hold changed");
        Ok(account)
    }

    async fn set_status(&self, account_id: AccountId, status: AccountStatus, now: DateTime<Utc>) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let mut account = load_account(tx.as_mut(), account_id).await?;
        if account.status == status {
            return Ok(account);
        }
        let previous = account.status;
        account.status = status;
        tx.update_account(&account).await?;
        tx.append_audit(&NewAudit::new(
            "ACCOUNT_STATUS",
            Some(account_id),
            format!("Account status changed from {previous} to {status}."),
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(account_id, from = %previous, to = %status, "Account status changed");
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::storage::MemoryLedgerStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn service(max_hits: i64) -> AccountService {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let fraud = FraudEngine::new(store.clone());
        fraud.init_default_rules(t0()).await.unwrap();
        let limiter = RateLimiter::new(
            store.clone(),
            &RateLimitConfig {
                window_secs: 60,
                max_hits,
            },
        );
        AccountService::new(store, fraud, limiter, ReferralConfig::default())
    }

    #[tokio::test]
    async fn test_signup_creates_pending_account() {
        let accounts = service(30).await;
        let device = DeviceContext::new("fp-1", "10.0.0.1");

        let account = accounts.signup("new@example.com", Role::User, &device, t0()).await.unwrap();

        assert_eq!(account.status, AccountStatus::Pending);
        assert_eq!(account.signup_fingerprint.as_deref(), Some("fp-1"));

        let duplicate = accounts.signup("NEW@example.com", Role::User, &device, t0()).await;
        assert!(matches!(duplicate, Err(LedgerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_suspended_account_cannot_log_in() {
        let accounts = service(30).await;
        let device = DeviceContext::new("fp-1", "10.0.0.1");
        let account = accounts.signup("user@example.com", Role::User, &device, t0()).await.unwrap();
        accounts.approve(account.id, t0()).await.unwrap();

        accounts.login("user@example.com", &device, t0()).await.unwrap();

        accounts.suspend(account.id, t0()).await.unwrap();
        let err = accounts.login("user@example.com", &device, t0()).await.unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn test_login_is_rate_limited_per_ip() {
        let accounts = service(2).await;
        let device = DeviceContext::new("fp-1", "10.0.0.7");
        accounts.signup("rl@example.com", Role::User, &device, t0()).await.unwrap();

        accounts.login("rl@example.com", &device, t0()).await.unwrap();
        accounts.login("rl@example.com", &device, t0()).await.unwrap();
        let err = accounts.login("rl@example.com", &device, t0()).await.unwrap_err();
        assert!(matches!(err, LedgerError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_referral_pays_both_accounts_once() {
        let accounts = service(30).await;
        let referrer = accounts
            .signup("referrer@example.com", Role::User, &DeviceContext::new("fp-a", "10.0.0.1"), t0())
            .await
            .unwrap();
        let code = referrer.referral_code.clone().unwrap();
        assert_eq!(code.len(), 8);

        let referee = accounts
            .signup_with_referral(
                "friend@example.com",
                Role::User,
                Some(&code.to_lowercase()),
                &DeviceContext::new("fp-b", "10.0.0.2"),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(referee.referred_by, Some(referrer.id));
        assert_ne!(referee.referral_code, referrer.referral_code);

        let btc = |balances: Vec<(Asset, Decimal)>| {
            balances.into_iter().find(|(asset, _)| *asset == Asset::Bitcoin).unwrap().1
        };
        assert_eq!(btc(accounts.balances(referrer.id).await.unwrap()), Decimal::new(1, 3));
        assert_eq!(btc(accounts.balances(referee.id).await.unwrap()), Decimal::new(1, 3));

        assert_eq!(accounts.pay_referral(referee.id, t0()).await.unwrap(), None);
        assert_eq!(btc(accounts.balances(referrer.id).await.unwrap()), Decimal::new(1, 3));

        let referred = accounts.referrals(referrer.id).await.unwrap();
        assert_eq!(referred.len(), 1);
        assert_eq!(referred[0].id, referee.id);
    }

    #[tokio::test]
    async fn test_unknown_referral_code_is_ignored() {
        let accounts = service(30).await;
        let account = accounts
            .signup_with_referral("solo@example.com", Role::User, Some("NOPE1234"), &DeviceContext::default(), t0())
            .await
            .unwrap();

        assert_eq!(account.referred_by, None);
        assert_eq!(accounts.pay_referral(account.id, t0()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_withdrawal_hold_toggles() {
        let accounts = service(30).await;
        let account = accounts
            .signup("held@example.com", Role::User, &DeviceContext::default(), t0())
            .await
            .unwrap();

        let held = accounts.suspend_withdrawals(account.id, t0()).await.unwrap();
        assert!(held.withdrawals_suspended);
        assert_eq!(held.status, AccountStatus::Pending);

        let released = accounts.enable_withdrawals(account.id, t0()).await.unwrap();
        assert!(!released.withdrawals_suspended);
    }

    #[tokio::test]
    async fn test_balances_cover_every_asset() {
        let accounts = service(30).await;
        let account = accounts
            .signup("b@example.com", Role::User, &DeviceContext::default(), t0())
            .await
            .unwrap();

        let balances = accounts.balances(account.id).await.unwrap();
        assert_eq!(balances.len(), 3);
        assert!(balances.iter().all(|(_, amount)| amount.is_zero()));
    }
}
