use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountId;

stored_enum! {
    /// Graduated response applied when a rule's limit is exceeded.
    pub enum FraudAction {
        Allow => "allow",
        Flag => "flag",
        Block => "block",
        FlagAndBlock => "flag_and_block",
    }
}

impl FraudAction {
    pub const fn flags(&self) -> bool {
        matches!(self, Self::Flag | Self::FlagAndBlock)
    }

    pub const fn blocks(&self) -> bool {
        matches!(self, Self::Block | Self::FlagAndBlock)
    }
}

stored_enum! {
    /// Rules the engine knows how to count.
    pub enum RuleKey {
        MaxDevicesPerUser => "max_devices_per_user",
        MaxUsersPerFingerprint => "max_users_per_fingerprint",
        MaxIpsPerUser24h => "max_ips_per_user_24h",
        MaxSignupsPerFingerprint24h => "max_signups_per_fingerprint_24h",
    }
}

impl RuleKey {
    pub const ALL: [RuleKey; 4] = [
        RuleKey::MaxDevicesPerUser,
        RuleKey::MaxUsersPerFingerprint,
        RuleKey::MaxIpsPerUser24h,
        RuleKey::MaxSignupsPerFingerprint24h,
    ];
}

/// Externally configurable threshold. Read fresh on every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudRule {
    pub key: String,
    pub limit: i64,
    pub action: FraudAction,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudFlag {
    pub id: i64,
    pub account_id: AccountId,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// One observed (account, fingerprint) pair; unique on that pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub account_id: AccountId,
    pub fingerprint: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate queries used by the background sweep.
///
/// Each variant returns the accounts whose count exceeds `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FraudScan {
    DevicesPerUser { limit: i64 },
    UsersPerFingerprint { limit: i64 },
    IpsPerUser { limit: i64, since: DateTime<Utc> },
    SignupsPerFingerprint { limit: i64, since: DateTime<Utc> },
}
