//! Reward normalization.
//!
//! Converts a provider's reward signal into platform points:
//! `usd = points / raw_unit` (or the USD value as given), then
//! `points = usd * base_rate`, floored to two decimals.
//!
//! Malformed or non-positive input never fails; it normalizes to zero and is
//! logged so the webhook path degrades to a zero-credit no-op.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

use crate::asset::Asset;

/// Provider points per USD when neither the callback nor config says otherwise.
pub const DEFAULT_RAW_UNIT: Decimal = dec!(60);

/// Raw reward fields extracted from a callback, still as provider text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewardSignal {
    /// Direct USD value, when the provider reports one.
    pub usd: Option<String>,
    /// Provider-denominated points.
    pub points: Option<String>,
    /// Provider points per USD.
    pub raw_unit: Option<String>,
}

impl RewardSignal {
    pub fn usd(value: impl Into<String>) -> Self {
        Self {
            usd: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn points(value: impl Into<String>, raw_unit: Option<String>) -> Self {
        Self {
            points: Some(value.into()),
            raw_unit,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.usd.is_none() && self.points.is_none()
    }
}

fn parse(field: &str, text: &str) -> Option<Decimal> {
    match text.trim().parse::<Decimal>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(field, value = %text, "Unparseable reward field");
            None
        }
    }
}

/// Normalize `signal` into platform points.
///
/// `default_raw_unit` applies when the signal carries points without a raw
/// unit. Returns zero for anything that is not a positive, well-formed reward.
pub fn normalize(signal: &RewardSignal, default_raw_unit: Decimal, base_rate: Decimal) -> Decimal {
    if base_rate <= Decimal::ZERO {
        warn!(%base_rate, "Non-positive base rate; reward normalized to zero");
        return Decimal::ZERO;
    }

    let usd = match (&signal.usd, &signal.points) {
        (Some(usd), _) if !usd.trim().is_empty() => match parse("usd", usd) {
            Some(v) => v,
            None => return Decimal::ZERO,
        },
        (_, Some(points)) => {
            let Some(points) = parse("points", points) else {
                return Decimal::ZERO;
            };
            if points <= Decimal::ZERO {
                return Decimal::ZERO;
            }
            let raw_unit = match signal.raw_unit.as_deref().map(str::trim) {
                Some(raw) if !raw.is_empty() => match parse("raw_unit", raw) {
                    Some(v) => v,
                    None => return Decimal::ZERO,
                },
                _ => default_raw_unit,
            };
            if raw_unit <= Decimal::ZERO {
                warn!(%raw_unit, "Non-positive raw unit; reward normalized to zero");
                return Decimal::ZERO;
            }
            match points.checked_div(raw_unit) {
                Some(v) => v,
                None => return Decimal::ZERO,
            }
        }
        _ => return Decimal::ZERO,
    };

    if usd <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    match usd.checked_mul(base_rate) {
        Some(points) => {
            let mut points = Asset::Points.floor(points).max(Decimal::ZERO);
            points.rescale(Asset::Points.scale());
            points
        }
        None => {
            warn!(%usd, %base_rate, "Reward overflow; normalized to zero");
            Decimal::ZERO
        }
    }
}
