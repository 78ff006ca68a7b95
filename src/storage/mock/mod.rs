//! In-memory ledger store for tests and local runs.
//!
//! Units of work are serialized by a single async mutex. Each unit of work
//! mutates a private copy of the state that replaces the shared state on
//! commit, so an uncommitted unit of work leaves no trace.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{LedgerStore, LedgerTx, Result, StorageError};
use crate::asset::Asset;
use crate::model::{
    Account, AccountId, AuditEntry, Deposit, DepositId, DepositStatus, DeviceRecord, FraudFlag,
    FraudRule, FraudScan, LedgerEntry, MiningSession, NewAccount, NewAudit, NewDeposit,
    NewPayout, NewPending, NewSession, PayoutId, PayoutRequest, PayoutStatus, PendingPoint,
    PendingStatus, Posting, ProcessedTransaction, SessionId,
};

#[derive(Debug, Clone, Default)]
struct State {
    sequences: HashMap<&'static str, i64>,
    accounts: BTreeMap<AccountId, Account>,
    balances: HashMap<(AccountId, Asset), Decimal>,
    ledger: Vec<LedgerEntry>,
    deposits: BTreeMap<DepositId, Deposit>,
    sessions: BTreeMap<SessionId, MiningSession>,
    processed: HashMap<String, ProcessedTransaction>,
    pending: BTreeMap<i64, PendingPoint>,
    rules: BTreeMap<String, FraudRule>,
    flags: Vec<FraudFlag>,
    devices: BTreeMap<(AccountId, String), DeviceRecord>,
    /// (account, ip) -> last seen.
    ips: BTreeMap<(AccountId, String), DateTime<Utc>>,
    settings: HashMap<String, String>,
    payouts: BTreeMap<PayoutId, PayoutRequest>,
    audit: Vec<AuditEntry>,
    hits: Vec<(String, DateTime<Utc>)>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
}

impl State {
    fn next_id(&mut self, table: &'static str) -> i64 {
        let seq = self.sequences.entry(table).or_insert(0);
        *seq += 1;
        *seq
    }
}

/// In-memory [`LedgerStore`].
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<State>>,
    fail_on_commit: RwLock<bool>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail until reset.
    pub async fn set_fail_on_commit(&self, fail: bool) {
        *self.fail_on_commit.write().await = fail;
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let fail_on_commit = *self.fail_on_commit.read().await;
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            fail_on_commit,
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    work: State,
    fail_on_commit: bool,
}

fn not_found(entity: &'static str, id: impl ToString) -> StorageError {
    StorageError::NotFound {
        entity,
        id: id.to_string(),
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn account(&mut self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.work.accounts.get(&id).cloned())
    }

    async fn account_by_email(&mut self, email: &str) -> Result<Option<Account>> {
        Ok(self
            .work
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn account_by_referral_code(&mut self, code: &str) -> Result<Option<Account>> {
        Ok(self
            .work
            .accounts
            .values()
            .find(|a| a.referral_code.as_deref() == Some(code))
            .cloned())
    }

    async fn referrals_of(&mut self, referrer: AccountId) -> Result<Vec<Account>> {
        Ok(self
            .work
            .accounts
            .values()
            .filter(|a| a.referred_by == Some(referrer))
            .cloned()
            .collect())
    }

    async fn insert_account(&mut self, account: &NewAccount) -> Result<Account> {
        if self.account_by_email(&account.email).await?.is_some() {
            return Err(StorageError::Duplicate {
                entity: "account",
                key: account.email.clone(),
            });
        }
        let id = self.work.next_id("accounts");
        let stored = Account {
            id,
            email: account.email.clone(),
            role: account.role,
            status: account.status,
            is_flagged: false,
            is_banned: false,
            personal_rate: None,
            signup_fingerprint: account.signup_fingerprint.clone(),
            referral_code: None,
            referred_by: None,
            mining_paused: false,
            withdrawals_suspended: false,
            created_at: account.created_at,
        };
        self.work.accounts.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update_account(&mut self, account: &Account) -> Result<()> {
        let stored = self
            .work
            .accounts
            .get_mut(&account.id)
            .ok_or_else(|| not_found("account", account.id))?;
        stored.status = account.status;
        stored.role = account.role;
        stored.is_flagged = account.is_flagged;
        stored.is_banned = account.is_banned;
        stored.personal_rate = account.personal_rate;
        stored.referral_code = account.referral_code.clone();
        stored.referred_by = account.referred_by;
        stored.mining_paused = account.mining_paused;
        stored.withdrawals_suspended = account.withdrawals_suspended;
        Ok(())
    }

    async fn balance(&mut self, account_id: AccountId, asset: Asset) -> Result<Decimal> {
        Ok(self
            .work
            .balances
            .get(&(account_id, asset))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn post(&mut self, posting: &Posting) -> Result<LedgerEntry> {
        if !self.work.accounts.contains_key(&posting.account_id) {
            return Err(not_found("account", posting.account_id));
        }
        let available = self.balance(posting.account_id, posting.asset).await?;
        let balance_after = available + posting.amount;
        if balance_after < Decimal::ZERO {
            return Err(StorageError::InsufficientBalance {
                account_id: posting.account_id,
                asset: posting.asset,
                available,
                requested: -posting.amount,
            });
        }
        self.work
            .balances
            .insert((posting.account_id, posting.asset), balance_after);

        let entry = LedgerEntry {
            id: self.work.next_id("ledger_entries"),
            account_id: posting.account_id,
            asset: posting.asset,
            amount: posting.amount,
            balance_after,
            kind: posting.kind,
            reference: posting.reference.clone(),
            created_at: posting.at,
        };
        self.work.ledger.push(entry.clone());
        Ok(entry)
    }

    async fn ledger_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .work
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn insert_deposit(&mut self, deposit: &NewDeposit) -> Result<Deposit> {
        let id = self.work.next_id("deposits");
        let stored = Deposit {
            id,
            account_id: deposit.account_id,
            asset: deposit.asset,
            amount: deposit.amount,
            usd_value: deposit.usd_value,
            status: DepositStatus::Pending,
            proof: None,
            created_at: deposit.created_at,
            updated_at: deposit.created_at,
        };
        self.work.deposits.insert(id, stored.clone());
        Ok(stored)
    }

    async fn deposit(&mut self, id: DepositId) -> Result<Option<Deposit>> {
        Ok(self.work.deposits.get(&id).cloned())
    }

    async fn update_deposit(&mut self, deposit: &Deposit) -> Result<()> {
        match self.work.deposits.get_mut(&deposit.id) {
            Some(stored) => {
                *stored = deposit.clone();
                Ok(())
            }
            None => Err(not_found("deposit", deposit.id)),
        }
    }

    async fn insert_session(&mut self, session: &NewSession) -> Result<MiningSession> {
        if self
            .work
            .sessions
            .values()
            .any(|s| s.deposit_id == session.deposit_id)
        {
            return Err(StorageError::Duplicate {
                entity: "mining session for deposit",
                key: session.deposit_id.to_string(),
            });
        }
        let id = self.work.next_id("mining_sessions");
        let stored = MiningSession {
            id,
            account_id: session.account_id,
            deposit_id: session.deposit_id,
            asset: session.asset,
            deposited_amount: session.deposited_amount,
            rate: session.rate,
            mined_amount: Decimal::ZERO,
            is_active: true,
            is_paused: false,
            created_at: session.created_at,
            last_checkpoint: None,
        };
        self.work.sessions.insert(id, stored.clone());
        Ok(stored)
    }

    async fn session(&mut self, id: SessionId) -> Result<Option<MiningSession>> {
        Ok(self.work.sessions.get(&id).cloned())
    }

    async fn sessions_for(&mut self, account_id: AccountId) -> Result<Vec<MiningSession>> {
        Ok(self
            .work
            .sessions
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn update_session(&mut self, session: &MiningSession) -> Result<()> {
        match self.work.sessions.get_mut(&session.id) {
            Some(stored) => {
                *stored = session.clone();
                Ok(())
            }
            None => Err(not_found("mining session", session.id)),
        }
    }

    async fn accruing_sessions(&mut self, after: SessionId, limit: u64) -> Result<Vec<SessionId>> {
        Ok(self
            .work
            .sessions
            .range(after + 1..)
            .filter(|(_, s)| s.is_active && !s.is_paused)
            .map(|(id, _)| *id)
            .take(limit as usize)
            .collect())
    }

    async fn mark_processed(&mut self, record: &ProcessedTransaction) -> Result<bool> {
        if self.work.processed.contains_key(&record.tx_id) {
            return Ok(false);
        }
        self.work
            .processed
            .insert(record.tx_id.clone(), record.clone());
        Ok(true)
    }

    async fn insert_pending(&mut self, pending: &NewPending) -> Result<PendingPoint> {
        let id = self.work.next_id("pending_points");
        let stored = PendingPoint {
            id,
            account_id: pending.account_id,
            amount: pending.amount,
            source: pending.source.clone(),
            external_ref: pending.external_ref.clone(),
            earned_at: pending.earned_at,
            status: pending.status,
            resolved_at: None,
        };
        self.work.pending.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update_pending(&mut self, pending: &PendingPoint) -> Result<()> {
        match self.work.pending.get_mut(&pending.id) {
            Some(stored) => {
                *stored = pending.clone();
                Ok(())
            }
            None => Err(not_found("pending point", pending.id)),
        }
    }

    async fn open_pending(
        &mut self,
        account_id: AccountId,
        source: &str,
        external_ref: &str,
    ) -> Result<Option<PendingPoint>> {
        Ok(self
            .work
            .pending
            .values()
            .find(|p| {
                p.account_id == account_id
                    && p.source == source
                    && p.external_ref.as_deref() == Some(external_ref)
                    && p.status == PendingStatus::Pending
            })
            .cloned())
    }

    async fn negative_pending(
        &mut self,
        account_id: AccountId,
        source: &str,
    ) -> Result<Vec<PendingPoint>> {
        Ok(self
            .work
            .pending
            .values()
            .filter(|p| {
                p.account_id == account_id
                    && p.source == source
                    && p.status == PendingStatus::NegativePending
            })
            .cloned()
            .collect())
    }

    async fn due_pending(&mut self, cutoff: DateTime<Utc>, limit: u64) -> Result<Vec<PendingPoint>> {
        let mut due: Vec<PendingPoint> = self
            .work
            .pending
            .values()
            .filter(|p| p.status == PendingStatus::Pending && p.earned_at <= cutoff)
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.earned_at, p.id));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn pending_for(&mut self, account_id: AccountId) -> Result<Vec<PendingPoint>> {
        Ok(self
            .work
            .pending
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn fraud_rule(&mut self, key: &str) -> Result<Option<FraudRule>> {
        Ok(self.work.rules.get(key).cloned())
    }

    async fn fraud_rules(&mut self) -> Result<Vec<FraudRule>> {
        Ok(self.work.rules.values().cloned().collect())
    }

    async fn put_fraud_rule(&mut self, rule: &FraudRule, overwrite: bool) -> Result<bool> {
        if !overwrite && self.work.rules.contains_key(&rule.key) {
            return Ok(false);
        }
        self.work.rules.insert(rule.key.clone(), rule.clone());
        Ok(true)
    }

    async fn has_fraud_flag(&mut self, account_id: AccountId) -> Result<bool> {
        Ok(self.work.flags.iter().any(|f| f.account_id == account_id))
    }

    async fn insert_fraud_flag(
        &mut self,
        account_id: AccountId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<FraudFlag> {
        let flag = FraudFlag {
            id: self.work.next_id("fraud_flags"),
            account_id,
            reason: reason.to_string(),
            created_at: at,
        };
        self.work.flags.push(flag.clone());
        Ok(flag)
    }

    async fn fraud_flags(&mut self) -> Result<Vec<FraudFlag>> {
        Ok(self.work.flags.clone())
    }

    async fn delete_fraud_flags(&mut self, account_id: AccountId) -> Result<u64> {
        let before = self.work.flags.len();
        self.work.flags.retain(|f| f.account_id != account_id);
        Ok((before - self.work.flags.len()) as u64)
    }

    async fn device_known(&mut self, account_id: AccountId, fingerprint: &str) -> Result<bool> {
        Ok(self
            .work
            .devices
            .contains_key(&(account_id, fingerprint.to_string())))
    }

    async fn insert_device(&mut self, device: &DeviceRecord) -> Result<()> {
        self.work
            .devices
            .entry((device.account_id, device.fingerprint.clone()))
            .or_insert_with(|| device.clone());
        Ok(())
    }

    async fn delete_devices(&mut self, account_id: AccountId) -> Result<u64> {
        let before = self.work.devices.len();
        self.work.devices.retain(|(id, _), _| *id != account_id);
        Ok((before - self.work.devices.len()) as u64)
    }

    async fn devices_for(&mut self, account_id: AccountId) -> Result<Vec<DeviceRecord>> {
        Ok(self
            .work
            .devices
            .values()
            .filter(|d| d.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn count_fingerprints(&mut self, account_id: AccountId) -> Result<i64> {
        Ok(self
            .work
            .devices
            .keys()
            .filter(|(id, _)| *id == account_id)
            .count() as i64)
    }

    async fn count_accounts_for_fingerprint(&mut self, fingerprint: &str) -> Result<i64> {
        Ok(self
            .work
            .devices
            .keys()
            .filter(|(_, fp)| fp == fingerprint)
            .count() as i64)
    }

    async fn ip_seen_since(
        &mut self,
        account_id: AccountId,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .work
            .ips
            .get(&(account_id, ip.to_string()))
            .is_some_and(|last_seen| *last_seen >= since))
    }

    async fn count_ips_since(&mut self, account_id: AccountId, since: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .work
            .ips
            .iter()
            .filter(|((id, _), last_seen)| *id == account_id && **last_seen >= since)
            .count() as i64)
    }

    async fn record_ip(&mut self, account_id: AccountId, ip: &str, at: DateTime<Utc>) -> Result<()> {
        let last_seen = self
            .work
            .ips
            .entry((account_id, ip.to_string()))
            .or_insert(at);
        if *last_seen < at {
            *last_seen = at;
        }
        Ok(())
    }

    async fn count_signups_since(&mut self, fingerprint: &str, since: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .work
            .accounts
            .values()
            .filter(|a| {
                a.signup_fingerprint.as_deref() == Some(fingerprint) && a.created_at >= since
            })
            .count() as i64)
    }

    async fn scan_violations(&mut self, scan: FraudScan) -> Result<Vec<AccountId>> {
        let mut violators: Vec<AccountId> = match scan {
            FraudScan::DevicesPerUser { limit } => {
                let mut per_account: BTreeMap<AccountId, i64> = BTreeMap::new();
                for (id, _) in self.work.devices.keys() {
                    *per_account.entry(*id).or_default() += 1;
                }
                per_account
                    .into_iter()
                    .filter(|(_, n)| *n > limit)
                    .map(|(id, _)| id)
                    .collect()
            }
            FraudScan::UsersPerFingerprint { limit } => {
                let mut per_fp: HashMap<&str, Vec<AccountId>> = HashMap::new();
                for (id, fp) in self.work.devices.keys() {
                    per_fp.entry(fp.as_str()).or_default().push(*id);
                }
                per_fp
                    .into_values()
                    .filter(|ids| ids.len() as i64 > limit)
                    .flatten()
                    .collect()
            }
            FraudScan::IpsPerUser { limit, since } => {
                let mut per_account: BTreeMap<AccountId, i64> = BTreeMap::new();
                for ((id, _), last_seen) in &self.work.ips {
                    if *last_seen >= since {
                        *per_account.entry(*id).or_default() += 1;
                    }
                }
                per_account
                    .into_iter()
                    .filter(|(_, n)| *n > limit)
                    .map(|(id, _)| id)
                    .collect()
            }
            FraudScan::SignupsPerFingerprint { limit, since } => {
                let mut per_fp: HashMap<&str, Vec<AccountId>> = HashMap::new();
                for account in self.work.accounts.values() {
                    if let Some(fp) = account.signup_fingerprint.as_deref() {
                        if account.created_at >= since {
                            per_fp.entry(fp).or_default().push(account.id);
                        }
                    }
                }
                per_fp
                    .into_values()
                    .filter(|ids| ids.len() as i64 > limit)
                    .flatten()
                    .collect()
            }
        };
        violators.sort_unstable();
        violators.dedup();
        Ok(violators)
    }

    async fn setting(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.work.settings.get(key).cloned())
    }

    async fn put_setting(&mut self, key: &str, value: &str) -> Result<()> {
        self.work
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn insert_payout(&mut self, payout: &NewPayout) -> Result<PayoutRequest> {
        let id = self.work.next_id("payouts");
        let stored = PayoutRequest {
            id,
            account_id: payout.account_id,
            kind: payout.kind,
            asset: payout.asset,
            amount: payout.amount,
            value: payout.value,
            destination: payout.destination.clone(),
            status: PayoutStatus::Pending,
            created_at: payout.created_at,
            updated_at: payout.created_at,
        };
        self.work.payouts.insert(id, stored.clone());
        Ok(stored)
    }

    async fn payout(&mut self, id: PayoutId) -> Result<Option<PayoutRequest>> {
        Ok(self.work.payouts.get(&id).cloned())
    }

    async fn update_payout(&mut self, payout: &PayoutRequest) -> Result<()> {
        match self.work.payouts.get_mut(&payout.id) {
            Some(stored) => {
                *stored = payout.clone();
                Ok(())
            }
            None => Err(not_found("payout", payout.id)),
        }
    }

    async fn append_audit(&mut self, entry: &NewAudit) -> Result<()> {
        let id = self.work.next_id("audit_log");
        self.work.audit.push(AuditEntry {
            id,
            category: entry.category.clone(),
            account_id: entry.account_id,
            message: entry.message.clone(),
            source_ip: entry.source_ip.clone(),
            created_at: entry.created_at,
        });
        Ok(())
    }

    async fn audit_entries(&mut self, account_id: Option<AccountId>) -> Result<Vec<AuditEntry>> {
        Ok(self
            .work
            .audit
            .iter()
            .filter(|e| account_id.is_none() || e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn count_hits(&mut self, key: &str, since: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .work
            .hits
            .iter()
            .filter(|(k, at)| k == key && *at >= since)
            .count() as i64)
    }

    async fn insert_hit(&mut self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.work.hits.push((key.to_string(), at));
        Ok(())
    }

    async fn prune_hits(&mut self, before: DateTime<Utc>) -> Result<u64> {
        let count = self.work.hits.len();
        self.work.hits.retain(|(_, at)| *at >= before);
        Ok((count - self.work.hits.len()) as u64)
    }

    async fn try_acquire_lease(
        &mut self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let available = match self.work.leases.get(name) {
            Some((current, expiry)) => current == holder || *expiry <= now,
            None => true,
        };
        if available {
            self.work
                .leases
                .insert(name.to_string(), (holder.to_string(), expires_at));
        }
        Ok(available)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.fail_on_commit {
            return Err(StorageError::Injected("commit"));
        }
        let MemoryTx {
            mut guard, work, ..
        } = *self;
        *guard = work;
        Ok(())
    }
}
