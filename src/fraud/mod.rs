//! Fraud rule engine.
//!
//! Rules are `(key, limit, action)` rows read fresh from the store on every
//! evaluation. Interactive choke points (signup, login, device tracking)
//! count the attempt's device and IP against each rule and record them in
//! the same unit of work when nothing is violated. A violated rule applies
//! its action in its own committed unit of work, and a blocking action
//! aborts the request only after every rule has been evaluated.
//! The background sweep applies the same actions without aborting anything.
//!
//! Counting rules:
//! - `max_devices_per_user`: distinct fingerprints ever seen for the account
//! - `max_users_per_fingerprint`: distinct accounts ever seen on the fingerprint
//! - `max_ips_per_user_24h`: distinct IPs for the account in the last 24 hours
//! - `max_signups_per_fingerprint_24h`: accounts created on the fingerprint in
//!   the last 24 hours
//!
//! A device or IP already on record for the account never counts again.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Result};
use crate::model::{
    Account, AccountId, AccountStatus, DeviceRecord, FraudAction, FraudFlag, FraudRule, FraudScan,
    NewAudit, RuleKey,
};
use crate::storage::{LedgerStore, LedgerTx};
use crate::utils::retry::with_conflict_retry;

const WINDOW_HOURS: i64 = 24;

/// Rules evaluated when an existing account logs in or reports a device.
const LOGIN_RULES: [RuleKey; 3] = [
    RuleKey::MaxUsersPerFingerprint,
    RuleKey::MaxDevicesPerUser,
    RuleKey::MaxIpsPerUser24h,
];

/// Rules evaluated right after an account is created.
const SIGNUP_RULES: [RuleKey; 2] = [
    RuleKey::MaxSignupsPerFingerprint24h,
    RuleKey::MaxUsersPerFingerprint,
];

impl RuleKey {
    /// Limit and description seeded by [`FraudEngine::init_default_rules`].
    pub const fn default_rule(&self) -> (i64, &'static str) {
        match self {
            RuleKey::MaxDevicesPerUser => (3, "Maximum devices allowed per user"),
            RuleKey::MaxUsersPerFingerprint => (3, "Maximum users allowed per device fingerprint"),
            RuleKey::MaxIpsPerUser24h => (5, "Maximum unique IPs per user in 24 hours"),
            RuleKey::MaxSignupsPerFingerprint24h => {
                (3, "Maximum signups per device fingerprint in 24 hours")
            }
        }
    }

    fn violation_message(&self, limit: i64) -> String {
        match self {
            RuleKey::MaxDevicesPerUser => format!("Maximum devices per user ({limit}) exceeded."),
            RuleKey::MaxUsersPerFingerprint => {
                format!("Maximum users per device ({limit}) exceeded for fingerprint.")
            }
            RuleKey::MaxIpsPerUser24h => {
                format!("Maximum unique IPs per user in 24h ({limit}) exceeded.")
            }
            RuleKey::MaxSignupsPerFingerprint24h => {
                format!("Maximum signups per device fingerprint in 24h ({limit}) exceeded.")
            }
        }
    }

    fn scan(&self, limit: i64, since: DateTime<Utc>) -> FraudScan {
        match self {
            RuleKey::MaxDevicesPerUser => FraudScan::DevicesPerUser { limit },
            RuleKey::MaxUsersPerFingerprint => FraudScan::UsersPerFingerprint { limit },
            RuleKey::MaxIpsPerUser24h => FraudScan::IpsPerUser { limit, since },
            RuleKey::MaxSignupsPerFingerprint24h => FraudScan::SignupsPerFingerprint { limit, since },
        }
    }
}

/// The device and network an interactive request came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceContext {
    pub fingerprint: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl DeviceContext {
    pub fn new(fingerprint: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            fingerprint: Some(fingerprint.into()),
            ip: Some(ip.into()),
            user_agent: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref().filter(|f| !f.is_empty())
    }

    fn ip(&self) -> Option<&str> {
        self.ip.as_deref().filter(|ip| !ip.is_empty())
    }
}

/// What applying a rule's action did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleDecision {
    /// A new flag was recorded.
    pub flagged: bool,
    /// The account moved to suspended.
    pub suspended: bool,
    /// The rule's action blocks, whether or not the account was already suspended.
    pub blocks: bool,
}

/// Summary of a background sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FraudSweepReport {
    pub violations: usize,
    pub flagged: usize,
    pub suspended: usize,
}

#[derive(Clone)]
pub struct FraudEngine {
    store: Arc<dyn LedgerStore>,
}

impl FraudEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Seed every known rule with its default limit and a blocking action.
    /// Existing rows are kept. Returns the number of rules written.
    pub async fn init_default_rules(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.store.begin().await?;
        let mut written = 0;
        for key in RuleKey::ALL {
            let (limit, description) = key.default_rule();
            let rule = FraudRule {
                key: key.as_str().to_string(),
                limit,
                action: FraudAction::Block,
                description: description.to_string(),
                updated_at: now,
            };
            if tx.put_fraud_rule(&rule, false).await? {
                written += 1;
            }
        }
        tx.commit().await?;
        if written > 0 {
            info!(written, "Default fraud rules initialized");
        }
        Ok(written)
    }

    pub async fn list_rules(&self) -> Result<Vec<FraudRule>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.fraud_rules().await?)
    }

    /// Change a rule's limit and action. Takes effect on the next evaluation.
    pub async fn update_rule(
        &self,
        key: &str,
        limit: i64,
        action: FraudAction,
        now: DateTime<Utc>,
    ) -> Result<FraudRule> {
        let rule_key = RuleKey::parse(key)
            .ok_or_else(|| LedgerError::InvalidRule(format!("unknown rule key {key}")))?;
        if limit <= 0 {
            return Err(LedgerError::InvalidRule(format!(
                "limit for {key} must be a positive integer, got {limit}"
            )));
        }

        let mut tx = self.store.begin().await?;
        let description = match tx.fraud_rule(key).await? {
            Some(existing) => existing.description,
            None => rule_key.default_rule().1.to_string(),
        };
        let rule = FraudRule {
            key: key.to_string(),
            limit,
            action,
            description,
            updated_at: now,
        };
        tx.put_fraud_rule(&rule, true).await?;
        tx.append_audit(&NewAudit::new(
            "FRAUD_RULE_UPDATED",
            None,
            format!("Fraud rule {key} set to limit {limit}, action {action}."),
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(rule = key, limit, action = %action, "Fraud rule updated");
        Ok(rule)
    }

    /// Apply `rule`'s action to the account and commit it immediately.
    ///
    /// Flags at most once per account; suspends only an account that is not
    /// already suspended. Admin accounts and `allow` rules are untouched.
    pub async fn evaluate(
        &self,
        account_id: AccountId,
        rule: RuleKey,
        violation_message: &str,
        now: DateTime<Utc>,
    ) -> Result<RuleDecision> {
        with_conflict_retry("fraud_evaluate", move || {
            self.evaluate_once(account_id, rule, violation_message, now)
        })
        .await
    }

    async fn evaluate_once(
        &self,
        account_id: AccountId,
        rule: RuleKey,
        violation_message: &str,
        now: DateTime<Utc>,
    ) -> Result<RuleDecision> {
        let mut tx = self.store.begin().await?;
        let Some(stored) = tx.fraud_rule(rule.as_str()).await? else {
            return Ok(RuleDecision::default());
        };
        let mut account = load_account(tx.as_mut(), account_id).await?;
        if account.is_admin() || stored.action == FraudAction::Allow {
            return Ok(RuleDecision::default());
        }

        let mut decision = RuleDecision {
            blocks: stored.action.blocks(),
            ..RuleDecision::default()
        };

        if stored.action.flags() && !tx.has_fraud_flag(account.id).await? {
            tx.insert_fraud_flag(account.id, violation_message, now).await?;
            account.is_flagged = true;
            decision.flagged = true;
        }
        if decision.blocks && account.status != AccountStatus::Suspended {
            account.status = AccountStatus::Suspended;
            decision.suspended = true;
        }

        if decision.flagged || decision.suspended {
            tx.update_account(&account).await?;
            tx.append_audit(&NewAudit::new(
                if decision.suspended {
                    "FRAUD_SUSPENDED"
                } else {
                    "FRAUD_FLAGGED"
                },
                Some(account.id),
                format!("Rule {rule} ({}): {violation_message}", stored.action),
                now,
            ))
            .await?;
            tx.commit().await?;
            warn!(
                account_id,
                rule = %rule,
                flagged = decision.flagged,
                suspended = decision.suspended,
                "Fraud rule applied"
            );
        }
        Ok(decision)
    }

    /// Run the signup rules for a freshly created account, then record its
    /// device if nothing blocked.
    pub async fn check_signup(&self, account_id: AccountId, device: &DeviceContext, now: DateTime<Utc>) -> Result<()> {
        self.check(account_id, &SIGNUP_RULES, device, now).await
    }

    /// Run the login rules, then record the device and IP if nothing blocked.
    pub async fn check_login(&self, account_id: AccountId, device: &DeviceContext, now: DateTime<Utc>) -> Result<()> {
        self.check(account_id, &LOGIN_RULES, device, now).await
    }

    /// Device report from an authenticated session; same rules as login.
    pub async fn track_device(&self, account_id: AccountId, device: &DeviceContext, now: DateTime<Utc>) -> Result<()> {
        self.check(account_id, &LOGIN_RULES, device, now).await
    }

    async fn check(
        &self,
        account_id: AccountId,
        rules: &[RuleKey],
        device: &DeviceContext,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let violations = with_conflict_retry("fraud_check", move || {
            self.count_and_record(account_id, rules, device, now)
        })
        .await?;
        if violations.is_empty() {
            return Ok(());
        }

        let mut blocked: Option<String> = None;
        for (rule, message) in violations {
            debug!(account_id, rule = %rule, "Fraud rule violated");
            let decision = self.evaluate(account_id, rule, &message, now).await?;
            if decision.blocks && blocked.is_none() {
                blocked = Some(message);
            }
        }
        if let Some(reason) = blocked {
            return Err(LedgerError::Blocked { reason });
        }

        // Only non-blocking rules fired: the attempt proceeds and is recorded.
        with_conflict_retry("record_device", move || self.record_once(account_id, device, now)).await
    }

    async fn record_once(&self, account_id: AccountId, device: &DeviceContext, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.store.begin().await?;
        record_device(tx.as_mut(), account_id, device, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Count the attempt against `rules` and, when none is violated, record
    /// its device and IP in the same unit of work. Concurrent attempts are
    /// therefore counted one after another. Violations are returned without
    /// committing anything.
    async fn count_and_record(
        &self,
        account_id: AccountId,
        rules: &[RuleKey],
        device: &DeviceContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<(RuleKey, String)>> {
        let mut tx = self.store.begin().await?;
        let account = load_account(tx.as_mut(), account_id).await?;

        let mut found = Vec::new();
        if !account.is_admin() {
            for &rule in rules {
                if let Some(message) = violation(tx.as_mut(), &account, rule, device, now).await? {
                    found.push((rule, message));
                }
            }
        }
        if found.is_empty() {
            record_device(tx.as_mut(), account_id, device, now).await?;
            tx.commit().await?;
        }
        Ok(found)
    }

    pub async fn list_flags(&self) -> Result<Vec<FraudFlag>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.fraud_flags().await?)
    }

    /// Remove an account's flags and device history and clear `is_flagged`.
    /// Account status is left as is.
    pub async fn clear_fraud_flag(&self, account_id: AccountId, now: DateTime<Utc>) -> Result<Account> {
        with_conflict_retry("clear_fraud_flag", move || self.clear_once(account_id, now)).await
    }

    async fn clear_once(&self, account_id: AccountId, now: DateTime<Utc>) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let mut account = load_account(tx.as_mut(), account_id).await?;
        let flags = tx.delete_fraud_flags(account_id).await?;
        let devices = tx.delete_devices(account_id).await?;
        account.is_flagged = false;
        tx.update_account(&account).await?;
        tx.append_audit(&NewAudit::new(
            "FRAUD_FLAG_CLEARED",
            Some(account_id),
            format!("Cleared {flags} fraud flags and {devices} device records."),
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(account_id, flags, devices, "Fraud flag cleared");
        Ok(account)
    }

    /// Scan every account against every rule and apply violated actions.
    ///
    /// Nothing is aborted; a blocking rule only suspends.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<FraudSweepReport> {
        let since = now - Duration::hours(WINDOW_HOURS);
        let mut report = FraudSweepReport::default();

        for rule in RuleKey::ALL {
            let (stored, violators) = {
                let mut tx = self.store.begin().await?;
                match tx.fraud_rule(rule.as_str()).await? {
                    Some(stored) if stored.action != FraudAction::Allow => {
                        let violators = tx.scan_violations(rule.scan(stored.limit, since)).await?;
                        (stored, violators)
                    }
                    _ => continue,
                }
            };

            let message = rule.violation_message(stored.limit);
            for account_id in violators {
                report.violations += 1;
                match self.evaluate(account_id, rule, &message, now).await {
                    Ok(decision) => {
                        report.flagged += usize::from(decision.flagged);
                        report.suspended += usize::from(decision.suspended);
                    }
                    Err(e) => warn!(account_id, rule = %rule, error = %e, "Fraud sweep evaluation failed"),
                }
            }
        }

        info!(
            violations = report.violations,
            flagged = report.flagged,
            suspended = report.suspended,
            "Fraud sweep complete"
        );
        Ok(report)
    }
}

/// The violation message if this attempt breaks `rule`.
async fn violation(
    tx: &mut dyn LedgerTx,
    account: &Account,
    rule: RuleKey,
    device: &DeviceContext,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let Some(stored) = tx.fraud_rule(rule.as_str()).await? else {
        return Ok(None);
    };
    if stored.action == FraudAction::Allow {
        return Ok(None);
    }
    let since = now - Duration::hours(WINDOW_HOURS);

    let count = match rule {
        RuleKey::MaxDevicesPerUser => match device.fingerprint() {
            Some(fp) if !tx.device_known(account.id, fp).await? => {
                tx.count_fingerprints(account.id).await? + 1
            }
            _ => return Ok(None),
        },
        RuleKey::MaxUsersPerFingerprint => match device.fingerprint() {
            Some(fp) if !tx.device_known(account.id, fp).await? => {
                tx.count_accounts_for_fingerprint(fp).await? + 1
            }
            _ => return Ok(None),
        },
        RuleKey::MaxIpsPerUser24h => match device.ip() {
            Some(ip) if !tx.ip_seen_since(account.id, ip, since).await? => {
                tx.count_ips_since(account.id, since).await? + 1
            }
            _ => return Ok(None),
        },
        // The new account already carries the fingerprint, so it counts itself.
        RuleKey::MaxSignupsPerFingerprint24h => match device.fingerprint() {
            Some(fp) => tx.count_signups_since(fp, since).await?,
            None => return Ok(None),
        },
    };

    Ok((count > stored.limit).then(|| rule.violation_message(stored.limit)))
}

async fn record_device(
    tx: &mut dyn LedgerTx,
    account_id: AccountId,
    device: &DeviceContext,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Some(fingerprint) = device.fingerprint() {
        tx.insert_device(&DeviceRecord {
            account_id,
            fingerprint: fingerprint.to_string(),
            ip: device.ip().map(str::to_string),
            user_agent: device.user_agent.clone(),
            created_at: now,
        })
        .await?;
    }
    if let Some(ip) = device.ip() {
        tx.record_ip(account_id, ip, now).await?;
    }
    Ok(())
}

async fn load_account(tx: &mut dyn LedgerTx, account_id: AccountId) -> Result<Account> {
    tx.account(account_id)
        .await?
        .ok_or_else(|| LedgerError::not_found("account", account_id))
}
