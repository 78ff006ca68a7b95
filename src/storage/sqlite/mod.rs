//! SQLite implementation of the ledger store.
//!
//! Queries are built with sea-query and executed through sqlx. Each unit of
//! work is one sqlx transaction; SQLite serializes writers, and a writer that
//! loses the race surfaces as `StorageError::Conflict` for the caller to retry.

mod rows;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_query::{Alias, Asterisk, Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use super::helpers::{format_decimal, format_timestamp};
use super::schema::{
    AccountIps, Accounts, AuditLog, Balances, Deposits, Devices, FraudFlags, FraudRules,
    LedgerEntries, MiningSessions, Payouts, PendingPoints, ProcessedTransactions, RateLimitHits,
    Settings, ALL_TABLES,
};
use super::{LedgerStore, LedgerTx, Result, StorageError};
use crate::asset::Asset;
use crate::config::SqliteConfig;
use crate::model::{
    Account, AccountId, AuditEntry, Deposit, DepositId, DepositStatus, DeviceRecord, FraudFlag,
    FraudRule, FraudScan, LedgerEntry, MiningSession, NewAccount, NewAudit, NewDeposit,
    NewPayout, NewPending, NewSession, PayoutId, PayoutRequest, PayoutStatus, PendingPoint,
    PendingStatus, Posting, ProcessedTransaction, SessionId,
};

/// SQLite-backed [`LedgerStore`].
#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database file in WAL mode.
    pub async fn connect(config: &SqliteConfig) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::InvalidValue {
                    column: "storage.sqlite.path",
                    value: format!("{}: {e}", config.path),
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init(&self) -> Result<()> {
        for statement in ALL_TABLES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx { tx }))
    }
}

/// One sqlx transaction. Dropping it without commit rolls back.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteTx {
    async fn fetch_count(&mut self, sql: String) -> Result<i64> {
        let row = sqlx::query(&sql).fetch_one(&mut *self.tx).await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    async fn fetch_ids<'q>(
        &mut self,
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<Vec<AccountId>> {
        let rows = query.fetch_all(&mut *self.tx).await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>(0).map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl LedgerTx for SqliteTx {
    async fn account(&mut self, id: AccountId) -> Result<Option<Account>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Accounts::Table)
            .and_where(Expr::col(Accounts::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(rows::account).transpose()
    }

    async fn account_by_email(&mut self, email: &str) -> Result<Option<Account>> {
        // email is declared COLLATE NOCASE
        let query = Query::select()
            .column(Asterisk)
            .from(Accounts::Table)
            .and_where(Expr::col(Accounts::Email).eq(email))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(rows::account).transpose()
    }

    async fn account_by_referral_code(&mut self, code: &str) -> Result<Option<Account>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Accounts::Table)
            .and_where(Expr::col(Accounts::ReferralCode).eq(code))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(rows::account).transpose()
    }

    async fn referrals_of(&mut self, referrer: AccountId) -> Result<Vec<Account>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Accounts::Table)
            .and_where(Expr::col(Accounts::ReferredBy).eq(referrer))
            .order_by(Accounts::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::account).collect()
    }

    async fn insert_account(&mut self, account: &NewAccount) -> Result<Account> {
        if self.account_by_email(&account.email).await?.is_some() {
            return Err(StorageError::Duplicate {
                entity: "account",
                key: account.email.clone(),
            });
        }

        let query = Query::insert()
            .into_table(Accounts::Table)
            .columns([
                Accounts::Email,
                Accounts::Role,
                Accounts::Status,
                Accounts::IsFlagged,
                Accounts::IsBanned,
                Accounts::SignupFingerprint,
                Accounts::CreatedAt,
            ])
            .values_panic([
                account.email.clone().into(),
                account.role.as_str().into(),
                account.status.as_str().into(),
                false.into(),
                false.into(),
                account.signup_fingerprint.clone().into(),
                format_timestamp(account.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        let id = sqlx::query(&query)
            .execute(&mut *self.tx)
            .await?
            .last_insert_rowid();

        Ok(Account {
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
        })
    }

    async fn update_account(&mut self, account: &Account) -> Result<()> {
        let query = Query::update()
            .table(Accounts::Table)
            .values([
                (Accounts::Role, account.role.as_str().into()),
                (Accounts::Status, account.status.as_str().into()),
                (Accounts::IsFlagged, account.is_flagged.into()),
                (Accounts::IsBanned, account.is_banned.into()),
                (
                    Accounts::PersonalRate,
                    account.personal_rate.map(format_decimal).into(),
                ),
                (Accounts::ReferralCode, account.referral_code.clone().into()),
                (Accounts::ReferredBy, account.referred_by.into()),
                (Accounts::MiningPaused, account.mining_paused.into()),
                (
                    Accounts::WithdrawalsSuspended,
                    account.withdrawals_suspended.into(),
                ),
            ])
            .and_where(Expr::col(Accounts::Id).eq(account.id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "account",
                id: account.id.to_string(),
            });
        }
        Ok(())
    }

    async fn balance(&mut self, account_id: AccountId, asset: Asset) -> Result<Decimal> {
        let query = Query::select()
            .column(Balances::Amount)
            .from(Balances::Table)
            .and_where(Expr::col(Balances::AccountId).eq(account_id))
            .and_where(Expr::col(Balances::Asset).eq(asset.as_str()))
            .to_string(SqliteQueryBuilder);

        match sqlx::query(&query).fetch_optional(&mut *self.tx).await? {
            Some(row) => {
                let text: String = row.try_get("amount")?;
                super::helpers::parse_decimal("amount", &text)
            }
            None => Ok(Decimal::ZERO),
        }
    }

    async fn post(&mut self, posting: &Posting) -> Result<LedgerEntry> {
        if self.account(posting.account_id).await?.is_none() {
            return Err(StorageError::NotFound {
                entity: "account",
                id: posting.account_id.to_string(),
            });
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

        let at = format_timestamp(posting.at);
        let upsert = Query::insert()
            .into_table(Balances::Table)
            .columns([
                Balances::AccountId,
                Balances::Asset,
                Balances::Amount,
                Balances::UpdatedAt,
            ])
            .values_panic([
                posting.account_id.into(),
                posting.asset.as_str().into(),
                format_decimal(balance_after).into(),
                at.clone().into(),
            ])
            .on_conflict(
                OnConflict::columns([Balances::AccountId, Balances::Asset])
                    .update_columns([Balances::Amount, Balances::UpdatedAt])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&upsert).execute(&mut *self.tx).await?;

        let insert = Query::insert()
            .into_table(LedgerEntries::Table)
            .columns([
                LedgerEntries::AccountId,
                LedgerEntries::Asset,
                LedgerEntries::Amount,
                LedgerEntries::BalanceAfter,
                LedgerEntries::Kind,
                LedgerEntries::Reference,
                LedgerEntries::CreatedAt,
            ])
            .values_panic([
                posting.account_id.into(),
                posting.asset.as_str().into(),
                format_decimal(posting.amount).into(),
                format_decimal(balance_after).into(),
                posting.kind.as_str().into(),
                posting.reference.clone().into(),
                at.into(),
            ])
            .to_string(SqliteQueryBuilder);
        let id = sqlx::query(&insert)
            .execute(&mut *self.tx)
            .await?
            .last_insert_rowid();

        Ok(LedgerEntry {
            id,
            account_id: posting.account_id,
            asset: posting.asset,
            amount: posting.amount,
            balance_after,
            kind: posting.kind,
            reference: posting.reference.clone(),
            created_at: posting.at,
        })
    }

    async fn ledger_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        let query = Query::select()
            .column(Asterisk)
            .from(LedgerEntries::Table)
            .and_where(Expr::col(LedgerEntries::AccountId).eq(account_id))
            .order_by(LedgerEntries::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::ledger_entry).collect()
    }

    async fn insert_deposit(&mut self, deposit: &NewDeposit) -> Result<Deposit> {
        let at = format_timestamp(deposit.created_at);
        let query = Query::insert()
            .into_table(Deposits::Table)
            .columns([
                Deposits::AccountId,
                Deposits::Asset,
                Deposits::Amount,
                Deposits::UsdValue,
                Deposits::Status,
                Deposits::CreatedAt,
                Deposits::UpdatedAt,
            ])
            .values_panic([
                deposit.account_id.into(),
                deposit.asset.as_str().into(),
                format_decimal(deposit.amount).into(),
                format_decimal(deposit.usd_value).into(),
                DepositStatus::Pending.as_str().into(),
                at.clone().into(),
                at.into(),
            ])
            .to_string(SqliteQueryBuilder);

        let id = sqlx::query(&query)
            .execute(&mut *self.tx)
            .await?
            .last_insert_rowid();

        Ok(Deposit {
            id,
            account_id: deposit.account_id,
            asset: deposit.asset,
            amount: deposit.amount,
            usd_value: deposit.usd_value,
            status: DepositStatus::Pending,
            proof: None,
            created_at: deposit.created_at,
            updated_at: deposit.created_at,
        })
    }

    async fn deposit(&mut self, id: DepositId) -> Result<Option<Deposit>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Deposits::Table)
            .and_where(Expr::col(Deposits::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(rows::deposit).transpose()
    }

    async fn update_deposit(&mut self, deposit: &Deposit) -> Result<()> {
        let query = Query::update()
            .table(Deposits::Table)
            .values([
                (Deposits::Status, deposit.status.as_str().into()),
                (Deposits::Proof, deposit.proof.clone().into()),
                (Deposits::UpdatedAt, format_timestamp(deposit.updated_at).into()),
            ])
            .and_where(Expr::col(Deposits::Id).eq(deposit.id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "deposit",
                id: deposit.id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_session(&mut self, session: &NewSession) -> Result<MiningSession> {
        let query = Query::insert()
            .into_table(MiningSessions::Table)
            .columns([
                MiningSessions::AccountId,
                MiningSessions::DepositId,
                MiningSessions::Asset,
                MiningSessions::DepositedAmount,
                MiningSessions::Rate,
                MiningSessions::MinedAmount,
                MiningSessions::IsActive,
                MiningSessions::IsPaused,
                MiningSessions::CreatedAt,
            ])
            .values_panic([
                session.account_id.into(),
                session.deposit_id.into(),
                session.asset.as_str().into(),
                format_decimal(session.deposited_amount).into(),
                format_decimal(session.rate).into(),
                format_decimal(Decimal::ZERO).into(),
                true.into(),
                false.into(),
                format_timestamp(session.created_at).into(),
            ])
            .on_conflict(
                OnConflict::column(MiningSessions::DepositId)
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Duplicate {
                entity: "mining session for deposit",
                key: session.deposit_id.to_string(),
            });
        }

        Ok(MiningSession {
            id: result.last_insert_rowid(),
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
        })
    }

    async fn session(&mut self, id: SessionId) -> Result<Option<MiningSession>> {
        let query = Query::select()
            .column(Asterisk)
            .from(MiningSessions::Table)
            .and_where(Expr::col(MiningSessions::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(rows::session).transpose()
    }

    async fn sessions_for(&mut self, account_id: AccountId) -> Result<Vec<MiningSession>> {
        let query = Query::select()
            .column(Asterisk)
            .from(MiningSessions::Table)
            .and_where(Expr::col(MiningSessions::AccountId).eq(account_id))
            .order_by(MiningSessions::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::session).collect()
    }

    async fn update_session(&mut self, session: &MiningSession) -> Result<()> {
        let query = Query::update()
            .table(MiningSessions::Table)
            .values([
                (
                    MiningSessions::MinedAmount,
                    format_decimal(session.mined_amount).into(),
                ),
                (MiningSessions::IsActive, session.is_active.into()),
                (MiningSessions::IsPaused, session.is_paused.into()),
                (
                    MiningSessions::LastCheckpoint,
                    session.last_checkpoint.map(format_timestamp).into(),
                ),
            ])
            .and_where(Expr::col(MiningSessions::Id).eq(session.id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "mining session",
                id: session.id.to_string(),
            });
        }
        Ok(())
    }

    async fn accruing_sessions(&mut self, after: SessionId, limit: u64) -> Result<Vec<SessionId>> {
        let query = Query::select()
            .column(MiningSessions::Id)
            .from(MiningSessions::Table)
            .and_where(Expr::col(MiningSessions::IsActive).eq(true))
            .and_where(Expr::col(MiningSessions::IsPaused).eq(false))
            .and_where(Expr::col(MiningSessions::Id).gt(after))
            .order_by(MiningSessions::Id, Order::Asc)
            .limit(limit)
            .to_string(SqliteQueryBuilder);

        self.fetch_ids(sqlx::query(&query)).await
    }

    async fn mark_processed(&mut self, record: &ProcessedTransaction) -> Result<bool> {
        let query = Query::insert()
            .into_table(ProcessedTransactions::Table)
            .columns([
                ProcessedTransactions::TxId,
                ProcessedTransactions::Provider,
                ProcessedTransactions::ProcessedAt,
            ])
            .values_panic([
                record.tx_id.clone().into(),
                record.provider.clone().into(),
                format_timestamp(record.processed_at).into(),
            ])
            .on_conflict(
                OnConflict::column(ProcessedTransactions::TxId)
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        debug!(tx_id = %record.tx_id, inserted = result.rows_affected() == 1, "Marked transaction");
        Ok(result.rows_affected() == 1)
    }

    async fn insert_pending(&mut self, pending: &NewPending) -> Result<PendingPoint> {
        let query = Query::insert()
            .into_table(PendingPoints::Table)
            .columns([
                PendingPoints::AccountId,
                PendingPoints::Amount,
                PendingPoints::Source,
                PendingPoints::ExternalRef,
                PendingPoints::EarnedAt,
                PendingPoints::Status,
            ])
            .values_panic([
                pending.account_id.into(),
                format_decimal(pending.amount).into(),
                pending.source.clone().into(),
                pending.external_ref.clone().into(),
                format_timestamp(pending.earned_at).into(),
                pending.status.as_str().into(),
            ])
            .to_string(SqliteQueryBuilder);

        let id = sqlx::query(&query)
            .execute(&mut *self.tx)
            .await?
            .last_insert_rowid();

        Ok(PendingPoint {
            id,
            account_id: pending.account_id,
            amount: pending.amount,
            source: pending.source.clone(),
            external_ref: pending.external_ref.clone(),
            earned_at: pending.earned_at,
            status: pending.status,
            resolved_at: None,
        })
    }

    async fn update_pending(&mut self, pending: &PendingPoint) -> Result<()> {
        let query = Query::update()
            .table(PendingPoints::Table)
            .values([
                (PendingPoints::Amount, format_decimal(pending.amount).into()),
                (PendingPoints::Status, pending.status.as_str().into()),
                (
                    PendingPoints::ResolvedAt,
                    pending.resolved_at.map(format_timestamp).into(),
                ),
            ])
            .and_where(Expr::col(PendingPoints::Id).eq(pending.id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "pending point",
                id: pending.id.to_string(),
            });
        }
        Ok(())
    }

    async fn open_pending(
        &mut self,
        account_id: AccountId,
        source: &str,
        external_ref: &str,
    ) -> Result<Option<PendingPoint>> {
        let query = Query::select()
            .column(Asterisk)
            .from(PendingPoints::Table)
            .and_where(Expr::col(PendingPoints::AccountId).eq(account_id))
            .and_where(Expr::col(PendingPoints::Source).eq(source))
            .and_where(Expr::col(PendingPoints::ExternalRef).eq(external_ref))
            .and_where(Expr::col(PendingPoints::Status).eq(PendingStatus::Pending.as_str()))
            .order_by(PendingPoints::Id, Order::Asc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(rows::pending).transpose()
    }

    async fn negative_pending(
        &mut self,
        account_id: AccountId,
        source: &str,
    ) -> Result<Vec<PendingPoint>> {
        let query = Query::select()
            .column(Asterisk)
            .from(PendingPoints::Table)
            .and_where(Expr::col(PendingPoints::AccountId).eq(account_id))
            .and_where(Expr::col(PendingPoints::Source).eq(source))
            .and_where(
                Expr::col(PendingPoints::Status).eq(PendingStatus::NegativePending.as_str()),
            )
            .order_by(PendingPoints::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::pending).collect()
    }

    async fn due_pending(&mut self, cutoff: DateTime<Utc>, limit: u64) -> Result<Vec<PendingPoint>> {
        let query = Query::select()
            .column(Asterisk)
            .from(PendingPoints::Table)
            .and_where(Expr::col(PendingPoints::Status).eq(PendingStatus::Pending.as_str()))
            .and_where(Expr::col(PendingPoints::EarnedAt).lte(format_timestamp(cutoff)))
            .order_by(PendingPoints::EarnedAt, Order::Asc)
            .order_by(PendingPoints::Id, Order::Asc)
            .limit(limit)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::pending).collect()
    }

    async fn pending_for(&mut self, account_id: AccountId) -> Result<Vec<PendingPoint>> {
        let query = Query::select()
            .column(Asterisk)
            .from(PendingPoints::Table)
            .and_where(Expr::col(PendingPoints::AccountId).eq(account_id))
            .order_by(PendingPoints::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::pending).collect()
    }

    async fn fraud_rule(&mut self, key: &str) -> Result<Option<FraudRule>> {
        let query = Query::select()
            .column(Asterisk)
            .from(FraudRules::Table)
            .and_where(Expr::col(FraudRules::RuleKey).eq(key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(rows::fraud_rule).transpose()
    }

    async fn fraud_rules(&mut self) -> Result<Vec<FraudRule>> {
        let query = Query::select()
            .column(Asterisk)
            .from(FraudRules::Table)
            .order_by(FraudRules::RuleKey, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::fraud_rule).collect()
    }

    async fn put_fraud_rule(&mut self, rule: &FraudRule, overwrite: bool) -> Result<bool> {
        let on_conflict = if overwrite {
            OnConflict::column(FraudRules::RuleKey)
                .update_columns([
                    FraudRules::LimitValue,
                    FraudRules::Action,
                    FraudRules::Description,
                    FraudRules::UpdatedAt,
                ])
                .to_owned()
        } else {
            OnConflict::column(FraudRules::RuleKey).do_nothing().to_owned()
        };

        let query = Query::insert()
            .into_table(FraudRules::Table)
            .columns([
                FraudRules::RuleKey,
                FraudRules::LimitValue,
                FraudRules::Action,
                FraudRules::Description,
                FraudRules::UpdatedAt,
            ])
            .values_panic([
                rule.key.clone().into(),
                rule.limit.into(),
                rule.action.as_str().into(),
                rule.description.clone().into(),
                format_timestamp(rule.updated_at).into(),
            ])
            .on_conflict(on_conflict)
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn has_fraud_flag(&mut self, account_id: AccountId) -> Result<bool> {
        let query = Query::select()
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("n"))
            .from(FraudFlags::Table)
            .and_where(Expr::col(FraudFlags::AccountId).eq(account_id))
            .to_string(SqliteQueryBuilder);

        Ok(self.fetch_count(query).await? > 0)
    }

    async fn insert_fraud_flag(
        &mut self,
        account_id: AccountId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<FraudFlag> {
        let query = Query::insert()
            .into_table(FraudFlags::Table)
            .columns([FraudFlags::AccountId, FraudFlags::Reason, FraudFlags::CreatedAt])
            .values_panic([
                account_id.into(),
                reason.into(),
                format_timestamp(at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        let id = sqlx::query(&query)
            .execute(&mut *self.tx)
            .await?
            .last_insert_rowid();

        Ok(FraudFlag {
            id,
            account_id,
            reason: reason.to_string(),
            created_at: at,
        })
    }

    async fn fraud_flags(&mut self) -> Result<Vec<FraudFlag>> {
        let query = Query::select()
            .column(Asterisk)
            .from(FraudFlags::Table)
            .order_by(FraudFlags::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::fraud_flag).collect()
    }

    async fn delete_fraud_flags(&mut self, account_id: AccountId) -> Result<u64> {
        let query = Query::delete()
            .from_table(FraudFlags::Table)
            .and_where(Expr::col(FraudFlags::AccountId).eq(account_id))
            .to_string(SqliteQueryBuilder);

        Ok(sqlx::query(&query)
            .execute(&mut *self.tx)
            .await?
            .rows_affected())
    }

    async fn device_known(&mut self, account_id: AccountId, fingerprint: &str) -> Result<bool> {
        let query = Query::select()
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("n"))
            .from(Devices::Table)
            .and_where(Expr::col(Devices::AccountId).eq(account_id))
            .and_where(Expr::col(Devices::Fingerprint).eq(fingerprint))
            .to_string(SqliteQueryBuilder);

        Ok(self.fetch_count(query).await? > 0)
    }

    async fn insert_device(&mut self, device: &DeviceRecord) -> Result<()> {
        let query = Query::insert()
            .into_table(Devices::Table)
            .columns([
                Devices::AccountId,
                Devices::Fingerprint,
                Devices::Ip,
                Devices::UserAgent,
                Devices::CreatedAt,
            ])
            .values_panic([
                device.account_id.into(),
                device.fingerprint.clone().into(),
                device.ip.clone().into(),
                device.user_agent.clone().into(),
                format_timestamp(device.created_at).into(),
            ])
            .on_conflict(
                OnConflict::columns([Devices::AccountId, Devices::Fingerprint])
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn delete_devices(&mut self, account_id: AccountId) -> Result<u64> {
        let query = Query::delete()
            .from_table(Devices::Table)
            .and_where(Expr::col(Devices::AccountId).eq(account_id))
            .to_string(SqliteQueryBuilder);

        Ok(sqlx::query(&query)
            .execute(&mut *self.tx)
            .await?
            .rows_affected())
    }

    async fn devices_for(&mut self, account_id: AccountId) -> Result<Vec<DeviceRecord>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Devices::Table)
            .and_where(Expr::col(Devices::AccountId).eq(account_id))
            .order_by(Devices::CreatedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::device).collect()
    }

    async fn count_fingerprints(&mut self, account_id: AccountId) -> Result<i64> {
        let query = Query::select()
            .expr_as(Expr::cust("COUNT(DISTINCT fingerprint)"), Alias::new("n"))
            .from(Devices::Table)
            .and_where(Expr::col(Devices::AccountId).eq(account_id))
            .to_string(SqliteQueryBuilder);

        self.fetch_count(query).await
    }

    async fn count_accounts_for_fingerprint(&mut self, fingerprint: &str) -> Result<i64> {
        let query = Query::select()
            .expr_as(Expr::cust("COUNT(DISTINCT account_id)"), Alias::new("n"))
            .from(Devices::Table)
            .and_where(Expr::col(Devices::Fingerprint).eq(fingerprint))
            .to_string(SqliteQueryBuilder);

        self.fetch_count(query).await
    }

    async fn ip_seen_since(
        &mut self,
        account_id: AccountId,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let query = Query::select()
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("n"))
            .from(AccountIps::Table)
            .and_where(Expr::col(AccountIps::AccountId).eq(account_id))
            .and_where(Expr::col(AccountIps::Ip).eq(ip))
            .and_where(Expr::col(AccountIps::LastSeen).gte(format_timestamp(since)))
            .to_string(SqliteQueryBuilder);

        Ok(self.fetch_count(query).await? > 0)
    }

    async fn count_ips_since(&mut self, account_id: AccountId, since: DateTime<Utc>) -> Result<i64> {
        let query = Query::select()
            .expr_as(Expr::cust("COUNT(DISTINCT ip)"), Alias::new("n"))
            .from(AccountIps::Table)
            .and_where(Expr::col(AccountIps::AccountId).eq(account_id))
            .and_where(Expr::col(AccountIps::LastSeen).gte(format_timestamp(since)))
            .to_string(SqliteQueryBuilder);

        self.fetch_count(query).await
    }

    async fn record_ip(&mut self, account_id: AccountId, ip: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO account_ips (account_id, ip, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (account_id, ip)
             DO UPDATE SET last_seen = MAX(account_ips.last_seen, excluded.last_seen)",
        )
        .bind(account_id)
        .bind(ip)
        .bind(format_timestamp(at))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn count_signups_since(&mut self, fingerprint: &str, since: DateTime<Utc>) -> Result<i64> {
        let query = Query::select()
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("n"))
            .from(Accounts::Table)
            .and_where(Expr::col(Accounts::SignupFingerprint).eq(fingerprint))
            .and_where(Expr::col(Accounts::CreatedAt).gte(format_timestamp(since)))
            .to_string(SqliteQueryBuilder);

        self.fetch_count(query).await
    }

    async fn scan_violations(&mut self, scan: FraudScan) -> Result<Vec<AccountId>> {
        match scan {
            FraudScan::DevicesPerUser { limit } => {
                self.fetch_ids(
                    sqlx::query(
                        "SELECT account_id FROM devices
                         GROUP BY account_id
                         HAVING COUNT(DISTINCT fingerprint) > ?1
                         ORDER BY account_id",
                    )
                    .bind(limit),
                )
                .await
            }
            FraudScan::UsersPerFingerprint { limit } => {
                self.fetch_ids(
                    sqlx::query(
                        "SELECT DISTINCT account_id FROM devices
                         WHERE fingerprint IN (
                             SELECT fingerprint FROM devices
                             GROUP BY fingerprint
                             HAVING COUNT(DISTINCT account_id) > ?1
                         )
                         ORDER BY account_id",
                    )
                    .bind(limit),
                )
                .await
            }
            FraudScan::IpsPerUser { limit, since } => {
                self.fetch_ids(
                    sqlx::query(
                        "SELECT account_id FROM account_ips
                         WHERE last_seen >= ?2
                         GROUP BY account_id
                         HAVING COUNT(DISTINCT ip) > ?1
                         ORDER BY account_id",
                    )
                    .bind(limit)
                    .bind(format_timestamp(since)),
                )
                .await
            }
            FraudScan::SignupsPerFingerprint { limit, since } => {
                self.fetch_ids(
                    sqlx::query(
                        "SELECT id FROM accounts
                         WHERE created_at >= ?2
                           AND signup_fingerprint IN (
                               SELECT signup_fingerprint FROM accounts
                               WHERE signup_fingerprint IS NOT NULL AND created_at >= ?2
                               GROUP BY signup_fingerprint
                               HAVING COUNT(*) > ?1
                           )
                         ORDER BY id",
                    )
                    .bind(limit)
                    .bind(format_timestamp(since)),
                )
                .await
            }
        }
    }

    async fn setting(&mut self, key: &str) -> Result<Option<String>> {
        let query = Query::select()
            .column(Settings::Value)
            .from(Settings::Table)
            .and_where(Expr::col(Settings::SettingKey).eq(key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    async fn put_setting(&mut self, key: &str, value: &str) -> Result<()> {
        let query = Query::insert()
            .into_table(Settings::Table)
            .columns([Settings::SettingKey, Settings::Value])
            .values_panic([key.into(), value.into()])
            .on_conflict(
                OnConflict::column(Settings::SettingKey)
                    .update_column(Settings::Value)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_payout(&mut self, payout: &NewPayout) -> Result<PayoutRequest> {
        let at = format_timestamp(payout.created_at);
        let query = Query::insert()
            .into_table(Payouts::Table)
            .columns([
                Payouts::AccountId,
                Payouts::Kind,
                Payouts::Asset,
                Payouts::Amount,
                Payouts::Value,
                Payouts::Destination,
                Payouts::Status,
                Payouts::CreatedAt,
                Payouts::UpdatedAt,
            ])
            .values_panic([
                payout.account_id.into(),
                payout.kind.as_str().into(),
                payout.asset.as_str().into(),
                format_decimal(payout.amount).into(),
                format_decimal(payout.value).into(),
                payout.destination.clone().into(),
                PayoutStatus::Pending.as_str().into(),
                at.clone().into(),
                at.into(),
            ])
            .to_string(SqliteQueryBuilder);

        let id = sqlx::query(&query)
            .execute(&mut *self.tx)
            .await?
            .last_insert_rowid();

        Ok(PayoutRequest {
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
        })
    }

    async fn payout(&mut self, id: PayoutId) -> Result<Option<PayoutRequest>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Payouts::Table)
            .and_where(Expr::col(Payouts::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(rows::payout).transpose()
    }

    async fn update_payout(&mut self, payout: &PayoutRequest) -> Result<()> {
        let query = Query::update()
            .table(Payouts::Table)
            .values([
                (Payouts::Status, payout.status.as_str().into()),
                (Payouts::UpdatedAt, format_timestamp(payout.updated_at).into()),
            ])
            .and_where(Expr::col(Payouts::Id).eq(payout.id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "payout",
                id: payout.id.to_string(),
            });
        }
        Ok(())
    }

    async fn append_audit(&mut self, entry: &NewAudit) -> Result<()> {
        let query = Query::insert()
            .into_table(AuditLog::Table)
            .columns([
                AuditLog::Category,
                AuditLog::AccountId,
                AuditLog::Message,
                AuditLog::SourceIp,
                AuditLog::CreatedAt,
            ])
            .values_panic([
                entry.category.clone().into(),
                entry.account_id.into(),
                entry.message.clone().into(),
                entry.source_ip.clone().into(),
                format_timestamp(entry.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn audit_entries(&mut self, account_id: Option<AccountId>) -> Result<Vec<AuditEntry>> {
        // The statement builder is not Send; render it before awaiting.
        let query = {
            let mut select = Query::select();
            select
                .column(Asterisk)
                .from(AuditLog::Table)
                .order_by(AuditLog::Id, Order::Asc);
            if let Some(id) = account_id {
                select.and_where(Expr::col(AuditLog::AccountId).eq(id));
            }
            select.to_string(SqliteQueryBuilder)
        };

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(rows::audit).collect()
    }

    async fn count_hits(&mut self, key: &str, since: DateTime<Utc>) -> Result<i64> {
        let query = Query::select()
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("n"))
            .from(RateLimitHits::Table)
            .and_where(Expr::col(RateLimitHits::Bucket).eq(key))
            .and_where(Expr::col(RateLimitHits::HitAt).gte(format_timestamp(since)))
            .to_string(SqliteQueryBuilder);

        self.fetch_count(query).await
    }

    async fn insert_hit(&mut self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let query = Query::insert()
            .into_table(RateLimitHits::Table)
            .columns([RateLimitHits::Bucket, RateLimitHits::HitAt])
            .values_panic([key.into(), format_timestamp(at).into()])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn prune_hits(&mut self, before: DateTime<Utc>) -> Result<u64> {
        let query = Query::delete()
            .from_table(RateLimitHits::Table)
            .and_where(Expr::col(RateLimitHits::HitAt).lt(format_timestamp(before)))
            .to_string(SqliteQueryBuilder);

        Ok(sqlx::query(&query)
            .execute(&mut *self.tx)
            .await?
            .rows_affected())
    }

    async fn try_acquire_lease(
        &mut self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO scheduler_leases (name, holder, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (name) DO UPDATE
             SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE scheduler_leases.holder = excluded.holder
                OR scheduler_leases.expires_at <= ?4",
        )
        .bind(name)
        .bind(holder)
        .bind(format_timestamp(expires_at))
        .bind(format_timestamp(now))
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
