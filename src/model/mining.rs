use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AccountId;
use crate::asset::Asset;

pub type DepositId = i64;
pub type SessionId = i64;

stored_enum! {
    pub enum DepositStatus {
        Pending => "pending",
        Submitted => "submitted",
        Confirmed => "confirmed",
        Rejected => "rejected",
    }
}

impl DepositStatus {
    /// Deposits only move forward; confirmed and rejected are terminal.
    pub fn can_transition_to(&self, next: DepositStatus) -> bool {
        use DepositStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted) | (Pending, Confirmed) | (Pending, Rejected)
                | (Submitted, Confirmed) | (Submitted, Rejected)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: DepositId,
    pub account_id: AccountId,
    pub asset: Asset,
    pub amount: Decimal,
    pub usd_value: Decimal,
    pub status: DepositStatus,
    /// Reference to the user-supplied transfer proof.
    pub proof: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub account_id: AccountId,
    pub asset: Asset,
    pub amount: Decimal,
    pub usd_value: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A time-accruing reward stream spawned by a confirmed deposit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningSession {
    pub id: SessionId,
    pub account_id: AccountId,
    pub deposit_id: DepositId,
    pub asset: Asset,
    pub deposited_amount: Decimal,
    /// Fraction of the deposit earned per 24h, in (0, 1].
    pub rate: Decimal,
    pub mined_amount: Decimal,
    pub is_active: bool,
    pub is_paused: bool,
    pub created_at: DateTime<Utc>,
    pub last_checkpoint: Option<DateTime<Utc>>,
}

impl MiningSession {
    /// Lifetime cap: `deposited_amount × rate`, floored to the asset unit.
    pub fn cap(&self) -> Decimal {
        self.asset.floor(self.deposited_amount * self.rate)
    }

    /// Time up to which rewards have been credited.
    pub fn checkpoint(&self) -> DateTime<Utc> {
        self.last_checkpoint.unwrap_or(self.created_at)
    }

    pub fn is_capped(&self) -> bool {
        self.mined_amount >= self.cap()
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub account_id: AccountId,
    pub deposit_id: DepositId,
    pub asset: Asset,
    pub deposited_amount: Decimal,
    pub rate: Decimal,
    pub created_at: DateTime<Utc>,
}
