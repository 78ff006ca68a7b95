//! Webhook reconciliation.
//!
//! Inbound provider callbacks are verified, deduplicated by transaction ID and
//! turned into pending-balance effects. The idempotency record and the effect
//! commit in the same unit of work, so at-least-once delivery yields exactly
//! one effect per transaction ID.
//!
//! Supported providers:
//! - BitLabs: reward, profile-completion and reconciliation callbacks
//! - CPX Research: survey completions and reversals
//! - AdGem: offer completions, reversals and player ban notifications

mod engine;
pub mod payload;
pub mod reconcile;
pub mod signature;

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::model::AccountId;

pub use engine::WebhookEngine;

/// An offerwall or survey provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    BitLabs,
    CpxResearch,
    AdGem,
}

impl Provider {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Provider::BitLabs => "bitlabs",
            Provider::CpxResearch => "cpx_research",
            Provider::AdGem => "adgem",
        }
    }

    /// HTTP status answered when a signature does not verify.
    ///
    /// BitLabs expects an acknowledgment for everything it delivers; the
    /// others treat a rejection code as final.
    pub const fn rejection_status(&self) -> u16 {
        match self {
            Provider::BitLabs => 200,
            Provider::CpxResearch | Provider::AdGem => 401,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback endpoint. BitLabs delivers three kinds on separate URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callback {
    BitLabsReward,
    BitLabsProfile,
    BitLabsReconcile,
    CpxResearch,
    AdGem,
}

impl Callback {
    pub const fn provider(&self) -> Provider {
        match self {
            Callback::BitLabsReward | Callback::BitLabsProfile | Callback::BitLabsReconcile => {
                Provider::BitLabs
            }
            Callback::CpxResearch => Provider::CpxResearch,
            Callback::AdGem => Provider::AdGem,
        }
    }

    /// Pending-point source recorded for completions from this endpoint.
    pub const fn source(&self) -> &'static str {
        match self {
            Callback::BitLabsReward | Callback::BitLabsReconcile => "bitlabs_reward",
            Callback::BitLabsProfile => "profile_completion",
            Callback::CpxResearch => "cpx_research_survey",
            Callback::AdGem => "adgem_offerwall",
        }
    }

    /// Audit categories for (completion, reversal).
    pub(crate) const fn audit_categories(&self) -> (&'static str, &'static str) {
        match self {
            Callback::BitLabsReward => ("BITLABS_REWARD", "BITLABS_REVERSED"),
            Callback::BitLabsProfile => ("PROFILE_COMPLETED_WEBHOOK", "PROFILE_REVERSED"),
            Callback::BitLabsReconcile => ("BITLABS_REWARD", "CHARGEBACK_PROCESSED"),
            Callback::CpxResearch => ("CPX_RESEARCH_COMPLETED", "CPX_RESEARCH_REVERSED"),
            Callback::AdGem => ("ADGEM_COMPLETED", "ADGEM_REVERSED"),
        }
    }
}

/// A delivered callback: its flat parameters plus what signature checks need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookRequest {
    /// Decoded parameters, sorted by key.
    pub params: BTreeMap<String, String>,
    /// The URL exactly as received; BitLabs signs it.
    pub raw_url: Option<String>,
    /// Address the request came from.
    pub source_ip: Option<String>,
}

impl WebhookRequest {
    /// Build from already-decoded key/value pairs (POST form or JSON body).
    pub fn from_params<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            params: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    /// Build from a received URL, decoding its query string. Relative URLs
    /// (path and query only) are accepted.
    pub fn from_url(raw_url: &str) -> Result<Self, url::ParseError> {
        let parsed = match url::Url::parse(raw_url) {
            Ok(parsed) => parsed,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                url::Url::parse("http://localhost/")?.join(raw_url)?
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            params: parsed.query_pairs().into_owned().collect(),
            raw_url: Some(raw_url.to_string()),
            source_ip: None,
        })
    }

    /// The request rebuilt from the signed prefix of its URL only, so that
    /// nothing appended after the BitLabs hash reaches the parser.
    pub fn bitlabs_signed(&self) -> Option<Self> {
        let raw_url = self.raw_url.as_deref()?;
        let payload = signature::bitlabs_payload(raw_url)?;
        let hash = signature::bitlabs_hash(raw_url)?;
        let mut signed = Self::from_url(payload).ok()?;
        signed.params.insert("hash".to_string(), hash.to_string());
        signed.raw_url = self.raw_url.clone();
        signed.source_ip = self.source_ip.clone();
        Some(signed)
    }

    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    /// First non-empty value among `names`.
    pub fn param(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.params.get(*name))
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
    }
}

/// Terminal result of handling one callback.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Signature missing or invalid; nothing persisted.
    Rejected { reason: String },
    /// Malformed or not actionable.
    Ignored { reason: String },
    /// Transaction ID already processed; no second effect.
    Duplicate { tx_id: String },
    /// Transaction recorded, no balance effect.
    UserNotFound { tx_id: String },
    Credited {
        tx_id: String,
        account_id: AccountId,
        amount: Decimal,
        netted: Decimal,
    },
    Reversed {
        tx_id: String,
        account_id: AccountId,
        deducted: Decimal,
        matched: bool,
    },
    Reconciled {
        tx_id: String,
        account_id: AccountId,
        processed: usize,
        total_deducted: Decimal,
    },
    BanUpdated { account_id: AccountId, banned: bool },
}

impl WebhookOutcome {
    pub fn is_effect(&self) -> bool {
        matches!(
            self,
            WebhookOutcome::Credited { .. }
                | WebhookOutcome::Reversed { .. }
                | WebhookOutcome::Reconciled { .. }
                | WebhookOutcome::BanUpdated { .. }
        )
    }

    /// The response an HTTP collaborator should send to `provider`.
    pub fn to_response(&self, provider: Provider) -> WebhookResponse {
        let (status, body) = match self {
            WebhookOutcome::Rejected { reason } => (
                provider.rejection_status(),
                json!({ "status": "ignored", "reason": reason }),
            ),
            WebhookOutcome::Ignored { reason } => {
                (200, json!({ "status": "ignored", "reason": reason }))
            }
            WebhookOutcome::Duplicate { tx_id } => {
                (200, json!({ "status": "ok", "reason": "duplicate", "tx": tx_id }))
            }
            WebhookOutcome::UserNotFound { tx_id } => (
                200,
                json!({ "status": "ok", "reason": "user not found", "tx": tx_id }),
            ),
            WebhookOutcome::Credited { tx_id, amount, .. } => (
                200,
                json!({ "status": "ok", "tx": tx_id, "points": amount.to_string() }),
            ),
            WebhookOutcome::Reversed { tx_id, deducted, .. } => (
                200,
                json!({ "status": "reversed", "tx": tx_id, "deducted": deducted.to_string() }),
            ),
            WebhookOutcome::Reconciled {
                tx_id,
                processed,
                total_deducted,
                ..
            } => (
                200,
                json!({
                    "status": "ok",
                    "tx": tx_id,
                    "processed_count": processed,
                    "total_deducted": total_deducted.to_string(),
                }),
            ),
            WebhookOutcome::BanUpdated { account_id, banned } => (
                200,
                json!({ "status": "ok", "player_id": account_id, "banned": banned }),
            ),
        };
        WebhookResponse { status, body }
    }
}

/// Acknowledgment to send back to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: Value,
}

#[cfg(test)]
mod tests;
