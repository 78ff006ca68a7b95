use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type AccountId = i64;

stored_enum! {
    /// Account review state. Only `Approved` accounts may move funds.
    pub enum AccountStatus {
        Pending => "pending",
        Approved => "approved",
        Suspended => "suspended",
        Rejected => "rejected",
    }
}

stored_enum! {
    pub enum Role {
        User => "user",
        Admin => "admin",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub role: Role,
    pub status: AccountStatus,
    pub is_flagged: bool,
    /// Set by the provider ban webhook; independent of `status`.
    pub is_banned: bool,
    /// Overrides the global mining rate for sessions created after it is set.
    pub personal_rate: Option<Decimal>,
    /// Fingerprint seen when the account was created, used for signup velocity.
    pub signup_fingerprint: Option<String>,
    /// Code other users sign up with to name this account as their referrer.
    pub referral_code: Option<String>,
    pub referred_by: Option<AccountId>,
    /// Admin hold on every mining session of the account.
    pub mining_paused: bool,
    /// Admin hold on withdrawals; redemptions and transfers are unaffected.
    pub withdrawals_suspended: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub role: Role,
    pub status: AccountStatus,
    pub signup_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}
