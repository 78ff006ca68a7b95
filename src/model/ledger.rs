use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AccountId;
use crate::asset::Asset;

stored_enum! {
    /// Reason a spendable balance moved.
    pub enum EntryKind {
        Deposit => "deposit",
        MiningReward => "mining_reward",
        PendingCleared => "pending_cleared",
        TransferIn => "transfer_in",
        TransferOut => "transfer_out",
        Withdrawal => "withdrawal",
        Redemption => "redemption",
        PayoutRefund => "payout_refund",
        ReferralReward => "referral_reward",
    }
}

/// A requested balance change. Applied with [`crate::storage::LedgerTx::post`].
#[derive(Debug, Clone)]
pub struct Posting {
    pub account_id: AccountId,
    pub asset: Asset,
    /// Signed change to the spendable balance.
    pub amount: Decimal,
    pub kind: EntryKind,
    /// Identifier of the record that caused the change (session, payout...).
    pub reference: String,
    pub at: DateTime<Utc>,
}

/// Append-only record of an applied posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: AccountId,
    pub asset: Asset,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub kind: EntryKind,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// Write-once idempotency record for an external transaction ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedTransaction {
    pub tx_id: String,
    pub provider: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub category: String,
    pub account_id: Option<AccountId>,
    pub message: String,
    pub source_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAudit {
    pub category: String,
    pub account_id: Option<AccountId>,
    pub message: String,
    pub source_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewAudit {
    pub fn new(
        category: impl Into<String>,
        account_id: Option<AccountId>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            category: category.into(),
            account_id,
            message: message.into(),
            source_ip: None,
            created_at: at,
        }
    }

    pub fn with_source_ip(mut self, ip: Option<&str>) -> Self {
        self.source_ip = ip.map(str::to_string);
        self
    }
}
