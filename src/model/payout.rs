use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AccountId;
use crate::asset::Asset;

pub type PayoutId = i64;

stored_enum! {
    pub enum PayoutKind {
        Withdrawal => "withdrawal",
        BtcRedemption => "btc_redemption",
        GiftCardRedemption => "gift_card_redemption",
    }
}

stored_enum! {
    pub enum PayoutStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

/// Funds leaving the ledger. The amount is debited when the request is
/// created and refunded if an admin rejects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub id: PayoutId,
    pub account_id: AccountId,
    pub kind: PayoutKind,
    pub asset: Asset,
    pub amount: Decimal,
    /// Converted value delivered to the user (BTC or gift-card currency).
    pub value: Decimal,
    pub destination: Option<String>,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayout {
    pub account_id: AccountId,
    pub kind: PayoutKind,
    pub asset: Asset,
    pub amount: Decimal,
    pub value: Decimal,
    pub destination: Option<String>,
    pub created_at: DateTime<Utc>,
}
