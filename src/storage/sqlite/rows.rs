//! Row decoding for the SQLite backend.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::asset::Asset;
use crate::model::{
    Account, AccountStatus, AuditEntry, Deposit, DepositStatus, DeviceRecord, EntryKind,
    FraudAction, FraudFlag, FraudRule, LedgerEntry, MiningSession, PayoutKind, PayoutRequest,
    PayoutStatus, PendingPoint, PendingStatus, Role,
};
use crate::storage::helpers::{
    parse_decimal, parse_enum, parse_optional_timestamp, parse_timestamp,
};
use crate::storage::{Result, StorageError};

fn text(row: &SqliteRow, column: &'static str) -> Result<String> {
    Ok(row.try_get::<String, _>(column)?)
}

fn asset(row: &SqliteRow) -> Result<Asset> {
    let value = text(row, "asset")?;
    value
        .parse::<Asset>()
        .map_err(|_| StorageError::InvalidValue {
            column: "asset",
            value,
        })
}

fn decimal(row: &SqliteRow, column: &'static str) -> Result<rust_decimal::Decimal> {
    parse_decimal(column, &text(row, column)?)
}

fn timestamp(row: &SqliteRow, column: &'static str) -> Result<chrono::DateTime<chrono::Utc>> {
    parse_timestamp(column, &text(row, column)?)
}

pub fn account(row: &SqliteRow) -> Result<Account> {
    let personal_rate: Option<String> = row.try_get("personal_rate")?;
    Ok(Account {
        id: row.try_get("id")?,
        email: text(row, "email")?,
        role: parse_enum("role", &text(row, "role")?, Role::parse)?,
        status: parse_enum("status", &text(row, "status")?, AccountStatus::parse)?,
        is_flagged: row.try_get("is_flagged")?,
        is_banned: row.try_get("is_banned")?,
        personal_rate: personal_rate
            .map(|r| parse_decimal("personal_rate", &r))
            .transpose()?,
        signup_fingerprint: row.try_get("signup_fingerprint")?,
        referral_code: row.try_get("referral_code")?,
        referred_by: row.try_get("referred_by")?,
        mining_paused: row.try_get("mining_paused")?,
        withdrawals_suspended: row.try_get("withdrawals_suspended")?,
        created_at: timestamp(row, "created_at")?,
    })
}

pub fn ledger_entry(row: &SqliteRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        asset: asset(row)?,
        amount: decimal(row, "amount")?,
        balance_after: decimal(row, "balance_after")?,
        kind: parse_enum("kind", &text(row, "kind")?, EntryKind::parse)?,
        reference: text(row, "reference")?,
        created_at: timestamp(row, "created_at")?,
    })
}

pub fn deposit(row: &SqliteRow) -> Result<Deposit> {
    Ok(Deposit {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        asset: asset(row)?,
        amount: decimal(row, "amount")?,
        usd_value: decimal(row, "usd_value")?,
        status: parse_enum("status", &text(row, "status")?, DepositStatus::parse)?,
        proof: row.try_get("proof")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

pub fn session(row: &SqliteRow) -> Result<MiningSession> {
    Ok(MiningSession {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        deposit_id: row.try_get("deposit_id")?,
        asset: asset(row)?,
        deposited_amount: decimal(row, "deposited_amount")?,
        rate: decimal(row, "rate")?,
        mined_amount: decimal(row, "mined_amount")?,
        is_active: row.try_get("is_active")?,
        is_paused: row.try_get("is_paused")?,
        created_at: timestamp(row, "created_at")?,
        last_checkpoint: parse_optional_timestamp("last_checkpoint", row.try_get("last_checkpoint")?)?,
    })
}

pub fn pending(row: &SqliteRow) -> Result<PendingPoint> {
    Ok(PendingPoint {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: decimal(row, "amount")?,
        source: text(row, "source")?,
        external_ref: row.try_get("external_ref")?,
        earned_at: timestamp(row, "earned_at")?,
        status: parse_enum("status", &text(row, "status")?, PendingStatus::parse)?,
        resolved_at: parse_optional_timestamp("resolved_at", row.try_get("resolved_at")?)?,
    })
}

pub fn fraud_rule(row: &SqliteRow) -> Result<FraudRule> {
    Ok(FraudRule {
        key: text(row, "rule_key")?,
        limit: row.try_get("limit_value")?,
        action: parse_enum("action", &text(row, "action")?, FraudAction::parse)?,
        description: text(row, "description")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

pub fn fraud_flag(row: &SqliteRow) -> Result<FraudFlag> {
    Ok(FraudFlag {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        reason: text(row, "reason")?,
        created_at: timestamp(row, "created_at")?,
    })
}

pub fn device(row: &SqliteRow) -> Result<DeviceRecord> {
    Ok(DeviceRecord {
        account_id: row.try_get("account_id")?,
        fingerprint: text(row, "fingerprint")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        created_at: timestamp(row, "created_at")?,
    })
}

pub fn payout(row: &SqliteRow) -> Result<PayoutRequest> {
    Ok(PayoutRequest {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        kind: parse_enum("kind", &text(row, "kind")?, PayoutKind::parse)?,
        asset: asset(row)?,
        amount: decimal(row, "amount")?,
        value: decimal(row, "value")?,
        destination: row.try_get("destination")?,
        status: parse_enum("status", &text(row, "status")?, PayoutStatus::parse)?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

pub fn audit(row: &SqliteRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.try_get("id")?,
        category: text(row, "category")?,
        account_id: row.try_get("account_id")?,
        message: text(row, "message")?,
        source_ip: row.try_get("source_ip")?,
        created_at: timestamp(row, "created_at")?,
    })
}
