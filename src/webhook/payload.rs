//! Callback field extraction.
//!
//! Turns a verified parameter set into a typed callback. Field aliases follow
//! each provider's documented names; anything missing or malformed yields an
//! "ignored" reason instead of an error.

use rust_decimal::Decimal;
use serde_json::Value;

use super::{Callback, WebhookRequest};
use crate::model::AccountId;
use crate::normalize::RewardSignal;

/// How a callback names its target account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRef {
    Id(AccountId),
    /// Matched case-insensitively.
    Email(String),
}

/// One line of a reconciliation callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chargeback {
    /// Platform points, rounded to two decimals.
    pub amount: Decimal,
    pub earning_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Complete {
        signal: RewardSignal,
        external_ref: Option<String>,
    },
    Reverse {
        signal: RewardSignal,
        external_ref: Option<String>,
    },
    Chargebacks {
        source: String,
        items: Vec<Chargeback>,
    },
    /// Recorded for replay protection but otherwise ignored.
    Unknown {
        status: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCallback {
    pub tx_id: String,
    pub user: UserRef,
    pub action: CallbackAction,
    /// Provider-reported client address, when present.
    pub client_ip: Option<String>,
}

const STATUS_COMPLETE: &str = "1";
const STATUS_REVERSAL: &str = "2";
const DEFAULT_CHARGEBACK_REASON: &str = "Unqualified/Invalid completion";

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

fn positive_id(text: Option<&str>) -> Option<AccountId> {
    text?.trim().parse::<AccountId>().ok().filter(|id| *id > 0)
}

/// Extract the typed callback, or the reason it is ignored.
pub fn parse(callback: Callback, request: &WebhookRequest) -> Result<ParsedCallback, String> {
    match callback {
        Callback::BitLabsReward | Callback::BitLabsProfile | Callback::BitLabsReconcile => {
            parse_bitlabs(callback, request)
        }
        Callback::CpxResearch => parse_cpx(request),
        Callback::AdGem => parse_adgem(request),
    }
}

fn parse_bitlabs(callback: Callback, request: &WebhookRequest) -> Result<ParsedCallback, String> {
    let uid = positive_id(request.param(&["UID", "user_id"])).ok_or("Invalid UID")?;
    let tx_id = request.param(&["TX", "transaction_id"]).ok_or("Missing TX")?;

    let action = if callback == Callback::BitLabsReconcile {
        let source = request
            .param(&["TYPE", "type"])
            .unwrap_or(Callback::BitLabsReward.source())
            .to_string();
        let items = match request.param(&["chargebacks"]) {
            Some(text) => parse_chargebacks(text)?,
            None => Vec::new(),
        };
        CallbackAction::Chargebacks { source, items }
    } else {
        CallbackAction::Complete {
            signal: RewardSignal {
                usd: owned(request.param(&["USD"])),
                points: owned(request.param(&["VAL", "value", "amount"])),
                raw_unit: owned(request.param(&["RAW", "raw"])),
            },
            external_ref: owned(
                request
                    .param(&["EARNING_ID", "earning_id", "OFFER_ID", "offer_id", "SURVEY_ID", "survey_id"])
                    .or(Some(tx_id)),
            ),
        }
    };

    Ok(ParsedCallback {
        tx_id: tx_id.to_string(),
        user: UserRef::Id(uid),
        action,
        client_ip: None,
    })
}

fn parse_cpx(request: &WebhookRequest) -> Result<ParsedCallback, String> {
    let (Some(status), Some(tx_id), Some(user)) = (
        request.param(&["status"]),
        request.param(&["trans_id"]),
        request.param(&["user_id"]),
    ) else {
        return Err("Missing required parameters".to_string());
    };

    let user = if user.chars().all(|c| c.is_ascii_digit()) {
        UserRef::Id(user.parse::<AccountId>().map_err(|_| "Invalid user_id")?)
    } else {
        UserRef::Email(user.to_string())
    };

    let signal = RewardSignal {
        usd: owned(request.param(&["amount_usd", "USD"])),
        points: owned(request.param(&["points", "amount_local", "VAL"])),
        raw_unit: owned(request.param(&["RAW"])),
    };
    let external_ref = owned(request.param(&["offer_id"]));

    Ok(ParsedCallback {
        tx_id: tx_id.to_string(),
        user,
        action: status_action(status, signal, external_ref),
        client_ip: owned(request.param(&["ip_click"])),
    })
}

fn parse_adgem(request: &WebhookRequest) -> Result<ParsedCallback, String> {
    let (Some(status), Some(tx_id), Some(player)) = (
        request.param(&["status"]),
        request.param(&["transaction_id"]),
        request.param(&["player_id"]),
    ) else {
        return Err("Missing required parameters".to_string());
    };
    let player = positive_id(Some(player)).ok_or("Invalid player_id")?;

    let signal = RewardSignal {
        usd: owned(request.param(&["payout"])),
        points: owned(request.param(&["amount"])),
        raw_unit: None,
    };
    let external_ref = owned(request.param(&["offer_id"]));

    Ok(ParsedCallback {
        tx_id: tx_id.to_string(),
        user: UserRef::Id(player),
        action: status_action(status, signal, external_ref),
        client_ip: None,
    })
}

fn status_action(status: &str, signal: RewardSignal, external_ref: Option<String>) -> CallbackAction {
    match status {
        STATUS_COMPLETE => CallbackAction::Complete {
            signal,
            external_ref,
        },
        STATUS_REVERSAL => CallbackAction::Reverse {
            signal,
            external_ref,
        },
        other => CallbackAction::Unknown {
            status: other.to_string(),
        },
    }
}

fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse the JSON `chargebacks` list. Entries without a positive amount are
/// dropped.
pub fn parse_chargebacks(text: &str) -> Result<Vec<Chargeback>, String> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("Invalid chargebacks payload: {e}"))?;
    let Value::Array(entries) = value else {
        return Err("Invalid chargebacks payload: expected a list".to_string());
    };

    let items = entries
        .iter()
        .filter_map(|entry| {
            let amount = entry
                .get("amount")
                .and_then(json_text)
                .and_then(|a| a.parse::<Decimal>().ok())?
                .round_dp(2);
            if amount <= Decimal::ZERO {
                return None;
            }
            let earning_id = ["earning_id", "survey_id", "offer_id", "game_id"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(json_text));
            let reason = entry
                .get("reason")
                .and_then(json_text)
                .unwrap_or_else(|| DEFAULT_CHARGEBACK_REASON.to_string());
            Some(Chargeback {
                amount,
                earning_id,
                reason,
            })
        })
        .collect();
    Ok(items)
}
