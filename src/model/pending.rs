use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AccountId;

pub type PendingId = i64;

stored_enum! {
    /// Lifecycle of a pending reward.
    ///
    /// Only `Pending` rows are promotable and count toward the pending
    /// balance. `NegativePending` rows carry an unresolved chargeback that is
    /// netted against later earnings from the same source.
    pub enum PendingStatus {
        Pending => "pending",
        Cleared => "cleared",
        ChargebackDeducted => "chargeback_deducted",
        NegativePending => "negative_pending",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPoint {
    pub id: PendingId,
    pub account_id: AccountId,
    /// Signed; negative only while `status` is `NegativePending`.
    pub amount: Decimal,
    pub source: String,
    pub external_ref: Option<String>,
    pub earned_at: DateTime<Utc>,
    pub status: PendingStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPending {
    pub account_id: AccountId,
    pub amount: Decimal,
    pub source: String,
    pub external_ref: Option<String>,
    pub earned_at: DateTime<Utc>,
    pub status: PendingStatus,
}
