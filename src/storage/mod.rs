//! Ledger persistence.
//!
//! All engines talk to storage through a [`LedgerTx`] unit of work obtained
//! from a [`LedgerStore`]. A unit of work either commits every write it made
//! or, when dropped without [`LedgerTx::commit`], none of them.
//!
//! Implementations:
//! - `SqliteLedgerStore`: SQLite via sqlx, queries built with sea-query
//! - `MemoryLedgerStore`: in-process store for tests and local runs

pub mod helpers;
pub mod mock;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::asset::Asset;
use crate::config::{StorageBackend, StorageConfig};
use crate::model::{
    Account, AccountId, AuditEntry, Deposit, DepositId, DeviceRecord, FraudFlag, FraudRule,
    FraudScan, LedgerEntry, MiningSession, NewAccount, NewAudit, NewDeposit, NewPayout,
    NewPending, NewSession, PayoutId, PayoutRequest, PendingPoint, Posting,
    ProcessedTransaction, SessionId,
};

pub use mock::MemoryLedgerStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedgerStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Another unit of work holds the rows; safe to retry.
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Insufficient {asset} balance for account {account_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        account_id: AccountId,
        asset: Asset,
        available: Decimal,
        requested: Decimal,
    },

    #[error("Duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("Invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("Injected failure: {0}")]
    Injected(&'static str),
}

impl StorageError {
    /// Whether the operation may succeed if the whole unit of work is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// SQLite result codes that mean "someone else holds the lock".
#[cfg(feature = "sqlite")]
const SQLITE_BUSY_CODES: [&str; 5] = ["5", "6", "261", "262", "517"];

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db
                .code()
                .is_some_and(|code| SQLITE_BUSY_CODES.contains(&code.as_ref()))
            {
                return StorageError::Conflict(db.message().to_string());
            }
        }
        StorageError::Database(e)
    }
}

/// Factory for units of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a unit of work. Writes become visible only on commit.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;
}

/// A single atomic unit of work against the ledger.
///
/// Every balance, session, pending, flag and idempotency mutation performed
/// by one engine call happens on the same `LedgerTx`, so partial failure
/// leaves nothing behind.
#[async_trait]
pub trait LedgerTx: Send {
    // --- accounts ---

    async fn account(&mut self, id: AccountId) -> Result<Option<Account>>;

    /// Case-insensitive lookup.
    async fn account_by_email(&mut self, email: &str) -> Result<Option<Account>>;

    async fn account_by_referral_code(&mut self, code: &str) -> Result<Option<Account>>;

    /// Accounts whose `referred_by` is `referrer`, ascending by id.
    async fn referrals_of(&mut self, referrer: AccountId) -> Result<Vec<Account>>;

    async fn insert_account(&mut self, account: &NewAccount) -> Result<Account>;

    /// Persist status, flag, ban, rate, referral and hold fields.
    async fn update_account(&mut self, account: &Account) -> Result<()>;

    // --- balances and ledger ---

    /// Spendable balance; zero if the account never held the asset.
    async fn balance(&mut self, account_id: AccountId, asset: Asset) -> Result<Decimal>;

    /// Apply a signed change to a spendable balance and append its ledger
    /// entry. Fails with `InsufficientBalance` if the result would be negative.
    async fn post(&mut self, posting: &Posting) -> Result<LedgerEntry>;

    async fn ledger_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>>;

    // --- deposits and mining sessions ---

    async fn insert_deposit(&mut self, deposit: &NewDeposit) -> Result<Deposit>;

    async fn deposit(&mut self, id: DepositId) -> Result<Option<Deposit>>;

    async fn update_deposit(&mut self, deposit: &Deposit) -> Result<()>;

    async fn insert_session(&mut self, session: &NewSession) -> Result<MiningSession>;

    async fn session(&mut self, id: SessionId) -> Result<Option<MiningSession>>;

    async fn update_session(&mut self, session: &MiningSession) -> Result<()>;

    /// Every session of the account, ascending by id.
    async fn sessions_for(&mut self, account_id: AccountId) -> Result<Vec<MiningSession>>;

    /// Active, unpaused sessions with id greater than `after`, ascending.
    async fn accruing_sessions(&mut self, after: SessionId, limit: u64) -> Result<Vec<SessionId>>;

    // --- idempotency ---

    /// Insert the record if its transaction ID is unseen.
    ///
    /// Returns `false` when the ID was already recorded.
    async fn mark_processed(&mut self, record: &ProcessedTransaction) -> Result<bool>;

    // --- pending points ---

    async fn insert_pending(&mut self, pending: &NewPending) -> Result<PendingPoint>;

    async fn update_pending(&mut self, pending: &PendingPoint) -> Result<()>;

    /// Oldest `pending` entry matching account, source and external reference.
    async fn open_pending(
        &mut self,
        account_id: AccountId,
        source: &str,
        external_ref: &str,
    ) -> Result<Option<PendingPoint>>;

    /// Unresolved chargebacks for a source, oldest first.
    async fn negative_pending(
        &mut self,
        account_id: AccountId,
        source: &str,
    ) -> Result<Vec<PendingPoint>>;

    /// `pending` entries earned at or before `cutoff`, oldest first.
    async fn due_pending(&mut self, cutoff: DateTime<Utc>, limit: u64) -> Result<Vec<PendingPoint>>;

    async fn pending_for(&mut self, account_id: AccountId) -> Result<Vec<PendingPoint>>;

    // --- fraud rules, flags and devices ---

    async fn fraud_rule(&mut self, key: &str) -> Result<Option<FraudRule>>;

    async fn fraud_rules(&mut self) -> Result<Vec<FraudRule>>;

    /// Insert or replace a rule. With `overwrite = false` an existing row is
    /// kept; returns whether a row was written.
    async fn put_fraud_rule(&mut self, rule: &FraudRule, overwrite: bool) -> Result<bool>;

    async fn has_fraud_flag(&mut self, account_id: AccountId) -> Result<bool>;

    async fn insert_fraud_flag(
        &mut self,
        account_id: AccountId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<FraudFlag>;

    async fn fraud_flags(&mut self) -> Result<Vec<FraudFlag>>;

    async fn delete_fraud_flags(&mut self, account_id: AccountId) -> Result<u64>;

    async fn device_known(&mut self, account_id: AccountId, fingerprint: &str) -> Result<bool>;

    /// Record the pair; a repeat of an existing pair is ignored.
    async fn insert_device(&mut self, device: &DeviceRecord) -> Result<()>;

    async fn delete_devices(&mut self, account_id: AccountId) -> Result<u64>;

    async fn devices_for(&mut self, account_id: AccountId) -> Result<Vec<DeviceRecord>>;

    /// Distinct fingerprints ever associated with the account.
    async fn count_fingerprints(&mut self, account_id: AccountId) -> Result<i64>;

    /// Distinct accounts ever associated with the fingerprint.
    async fn count_accounts_for_fingerprint(&mut self, fingerprint: &str) -> Result<i64>;

    /// Whether the account used `ip` at or after `since`.
    async fn ip_seen_since(
        &mut self,
        account_id: AccountId,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<bool>;

    /// Distinct IPs the account used at or after `since`.
    async fn count_ips_since(&mut self, account_id: AccountId, since: DateTime<Utc>) -> Result<i64>;

    /// Upsert the (account, ip) pair's last-seen time.
    async fn record_ip(&mut self, account_id: AccountId, ip: &str, at: DateTime<Utc>) -> Result<()>;

    /// Accounts created with `fingerprint` at or after `since`.
    async fn count_signups_since(&mut self, fingerprint: &str, since: DateTime<Utc>) -> Result<i64>;

    /// Accounts violating the scanned threshold, ascending by id.
    async fn scan_violations(&mut self, scan: FraudScan) -> Result<Vec<AccountId>>;

    // --- settings ---

    async fn setting(&mut self, key: &str) -> Result<Option<String>>;

    async fn put_setting(&mut self, key: &str, value: &str) -> Result<()>;

    // --- payouts ---

    async fn insert_payout(&mut self, payout: &NewPayout) -> Result<PayoutRequest>;

    async fn payout(&mut self, id: PayoutId) -> Result<Option<PayoutRequest>>;

    async fn update_payout(&mut self, payout: &PayoutRequest) -> Result<()>;

    // --- audit trail ---

    async fn append_audit(&mut self, entry: &NewAudit) -> Result<()>;

    /// Entries for one account, or all entries when `None`, oldest first.
    async fn audit_entries(&mut self, account_id: Option<AccountId>) -> Result<Vec<AuditEntry>>;

    // --- rate limiting ---

    async fn count_hits(&mut self, key: &str, since: DateTime<Utc>) -> Result<i64>;

    async fn insert_hit(&mut self, key: &str, at: DateTime<Utc>) -> Result<()>;

    /// Delete every hit older than `before`.
    async fn prune_hits(&mut self, before: DateTime<Utc>) -> Result<u64>;

    // --- scheduler leases ---

    /// Take or renew the named lease if it is free, expired, or already held
    /// by `holder`.
    async fn try_acquire_lease(
        &mut self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Make every write of this unit of work durable.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Initialize the configured ledger store.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn LedgerStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Storage: in-memory");
            Ok(Arc::new(MemoryLedgerStore::new()))
        }
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite => {
            info!("Storage: sqlite at {}", config.sqlite.path);
            let store = SqliteLedgerStore::connect(&config.sqlite).await?;
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageBackend::Sqlite => {
            tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err("SQLite feature not enabled".into())
        }
    }
}
