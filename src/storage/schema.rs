//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

#[derive(Iden)]
pub enum Accounts {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "email"]
    Email,
    #[iden = "role"]
    Role,
    #[iden = "status"]
    Status,
    #[iden = "is_flagged"]
    IsFlagged,
    #[iden = "is_banned"]
    IsBanned,
    #[iden = "personal_rate"]
    PersonalRate,
    #[iden = "signup_fingerprint"]
    SignupFingerprint,
    #[iden = "referral_code"]
    ReferralCode,
    #[iden = "referred_by"]
    ReferredBy,
    #[iden = "mining_paused"]
    MiningPaused,
    #[iden = "withdrawals_suspended"]
    WithdrawalsSuspended,
    #[iden = "created_at"]
    CreatedAt,
}

#[derive(Iden)]
pub enum Balances {
    Table,
    #[iden = "account_id"]
    AccountId,
    #[iden = "asset"]
    Asset,
    #[iden = "amount"]
    Amount,
    #[iden = "updated_at"]
    UpdatedAt,
}

#[derive(Iden)]
pub enum LedgerEntries {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "account_id"]
    AccountId,
    #[iden = "asset"]
    Asset,
    #[iden = "amount"]
    Amount,
    #[iden = "balance_after"]
    BalanceAfter,
    #[iden = "kind"]
    Kind,
    #[iden = "reference"]
    Reference,
    #[iden = "created_at"]
    CreatedAt,
}

#[derive(Iden)]
pub enum Deposits {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "account_id"]
    AccountId,
    #[iden = "asset"]
    Asset,
    #[iden = "amount"]
    Amount,
    #[iden = "usd_value"]
    UsdValue,
    #[iden = "status"]
    Status,
    #[iden = "proof"]
    Proof,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

#[derive(Iden)]
pub enum MiningSessions {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "account_id"]
    AccountId,
    #[iden = "deposit_id"]
    DepositId,
    #[iden = "asset"]
    Asset,
    #[iden = "deposited_amount"]
    DepositedAmount,
    #[iden = "rate"]
    Rate,
    #[iden = "mined_amount"]
    MinedAmount,
    #[iden = "is_active"]
    IsActive,
    #[iden = "is_paused"]
    IsPaused,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "last_checkpoint"]
    LastCheckpoint,
}

#[derive(Iden)]
pub enum ProcessedTransactions {
    Table,
    #[iden = "tx_id"]
    TxId,
    #[iden = "provider"]
    Provider,
    #[iden = "processed_at"]
    ProcessedAt,
}

#[derive(Iden)]
pub enum PendingPoints {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "account_id"]
    AccountId,
    #[iden = "amount"]
    Amount,
    #[iden = "source"]
    Source,
    #[iden = "external_ref"]
    ExternalRef,
    #[iden = "earned_at"]
    EarnedAt,
    #[iden = "status"]
    Status,
    #[iden = "resolved_at"]
    ResolvedAt,
}

#[derive(Iden)]
pub enum FraudRules {
    Table,
    #[iden = "rule_key"]
    RuleKey,
    #[iden = "limit_value"]
    LimitValue,
    #[iden = "action"]
    Action,
    #[iden = "description"]
    Description,
    #[iden = "updated_at"]
    UpdatedAt,
}

#[derive(Iden)]
pub enum FraudFlags {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "account_id"]
    AccountId,
    #[iden = "reason"]
    Reason,
    #[iden = "created_at"]
    CreatedAt,
}

#[derive(Iden)]
pub enum Devices {
    Table,
    #[iden = "account_id"]
    AccountId,
    #[iden = "fingerprint"]
    Fingerprint,
    #[iden = "ip"]
    Ip,
    #[iden = "user_agent"]
    UserAgent,
    #[iden = "created_at"]
    CreatedAt,
}

#[derive(Iden)]
pub enum AccountIps {
    Table,
    #[iden = "account_id"]
    AccountId,
    #[iden = "ip"]
    Ip,
    #[iden = "first_seen"]
    FirstSeen,
    #[iden = "last_seen"]
    LastSeen,
}

#[derive(Iden)]
pub enum Settings {
    Table,
    #[iden = "setting_key"]
    SettingKey,
    #[iden = "value"]
    Value,
}

#[derive(Iden)]
pub enum Payouts {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "account_id"]
    AccountId,
    #[iden = "kind"]
    Kind,
    #[iden = "asset"]
    Asset,
    #[iden = "amount"]
    Amount,
    #[iden = "value"]
    Value,
    #[iden = "destination"]
    Destination,
    #[iden = "status"]
    Status,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

#[derive(Iden)]
pub enum AuditLog {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "category"]
    Category,
    #[iden = "account_id"]
    AccountId,
    #[iden = "message"]
    Message,
    #[iden = "source_ip"]
    SourceIp,
    #[iden = "created_at"]
    CreatedAt,
}

#[derive(Iden)]
pub enum RateLimitHits {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "bucket"]
    Bucket,
    #[iden = "hit_at"]
    HitAt,
}

#[derive(Iden)]
pub enum SchedulerLeases {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "holder"]
    Holder,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// SQL for creating account, balance and ledger tables.
pub const CREATE_ACCOUNT_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
    role TEXT NOT NULL,
    status TEXT NOT NULL,
    is_flagged INTEGER NOT NULL DEFAULT 0,
    is_banned INTEGER NOT NULL DEFAULT 0,
    personal_rate TEXT,
    signup_fingerprint TEXT,
    referral_code TEXT UNIQUE,
    referred_by INTEGER REFERENCES accounts(id),
    mining_paused INTEGER NOT NULL DEFAULT 0,
    withdrawals_suspended INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_accounts_signup_fp ON accounts(signup_fingerprint, created_at);

CREATE TABLE IF NOT EXISTS balances (
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    asset TEXT NOT NULL,
    amount TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_id, asset)
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    asset TEXT NOT NULL,
    amount TEXT NOT NULL,
    balance_after TEXT NOT NULL,
    kind TEXT NOT NULL,
    reference TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_entries_account ON ledger_entries(account_id, id);
"#;

/// SQL for creating deposit and mining session tables.
pub const CREATE_MINING_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS deposits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    asset TEXT NOT NULL,
    amount TEXT NOT NULL,
    usd_value TEXT NOT NULL,
    status TEXT NOT NULL,
    proof TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mining_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    deposit_id INTEGER NOT NULL UNIQUE REFERENCES deposits(id),
    asset TEXT NOT NULL,
    deposited_amount TEXT NOT NULL,
    rate TEXT NOT NULL,
    mined_amount TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_paused INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_checkpoint TEXT
);

CREATE INDEX IF NOT EXISTS idx_mining_sessions_accruing ON mining_sessions(is_active, is_paused, id);
"#;

/// SQL for creating webhook idempotency and pending reward tables.
pub const CREATE_PENDING_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS processed_transactions (
    tx_id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    processed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    amount TEXT NOT NULL,
    source TEXT NOT NULL,
    external_ref TEXT,
    earned_at TEXT NOT NULL,
    status TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_points_due ON pending_points(status, earned_at);
CREATE INDEX IF NOT EXISTS idx_pending_points_match ON pending_points(account_id, source, status);
"#;

/// SQL for creating fraud rule, flag and device tables.
pub const CREATE_FRAUD_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS fraud_rules (
    rule_key TEXT PRIMARY KEY,
    limit_value INTEGER NOT NULL,
    action TEXT NOT NULL,
    description TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fraud_flags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fraud_flags_account ON fraud_flags(account_id);

CREATE TABLE IF NOT EXISTS devices (
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    fingerprint TEXT NOT NULL,
    ip TEXT,
    user_agent TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (account_id, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_devices_fingerprint ON devices(fingerprint);

CREATE TABLE IF NOT EXISTS account_ips (
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    ip TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    PRIMARY KEY (account_id, ip)
);
"#;

/// SQL for creating settings, payout, audit and coordination tables.
pub const CREATE_SUPPORT_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    setting_key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payouts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    kind TEXT NOT NULL,
    asset TEXT NOT NULL,
    amount TEXT NOT NULL,
    value TEXT NOT NULL,
    destination TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    account_id INTEGER,
    message TEXT NOT NULL,
    source_ip TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rate_limit_hits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket TEXT NOT NULL,
    hit_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rate_limit_hits ON rate_limit_hits(bucket, hit_at);

CREATE TABLE IF NOT EXISTS scheduler_leases (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

/// All schema statements in dependency order.
pub const ALL_TABLES: [&str; 5] = [
    CREATE_ACCOUNT_TABLES,
    CREATE_MINING_TABLES,
    CREATE_PENDING_TABLES,
    CREATE_FRAUD_TABLES,
    CREATE_SUPPORT_TABLES,
];
