//! Runtime-tunable settings.
//!
//! Settings are read from the store on every operation so an admin change
//! applies to the next request; configuration supplies the fallback.

use rust_decimal::Decimal;
use tracing::warn;

use crate::error::{LedgerError, Result};
use crate::storage::LedgerTx;

pub const BASE_DOLLAR: &str = "base_dollar";
pub const GLOBAL_MINING_RATE: &str = "global_mining_rate";
pub const POINT_TO_BTC_RATE: &str = "point_to_btc_rate";
pub const POINT_TO_GIFT_RATE: &str = "point_to_gift_rate";
pub const REFERRAL_REWARD_ENABLED: &str = "referral_reward_enabled";
pub const REFERRER_REWARD_AMOUNT: &str = "referrer_reward_amount";
pub const REFERRAL_REWARD_AMOUNT: &str = "referral_reward_amount";

/// Read a decimal setting, falling back when it is absent or unparseable.
pub async fn decimal_setting(tx: &mut dyn LedgerTx, key: &str, fallback: Decimal) -> Result<Decimal> {
    match tx.setting(key).await? {
        Some(text) => match text.trim().parse::<Decimal>() {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!(key, value = %text, "Unparseable setting; using configured default");
                Ok(fallback)
            }
        },
        None => Ok(fallback),
    }
}

/// Read a `true`/`false` setting, falling back when absent or unparseable.
pub async fn bool_setting(tx: &mut dyn LedgerTx, key: &str, fallback: bool) -> Result<bool> {
    Ok(tx
        .setting(key)
        .await?
        .and_then(|text| text.trim().parse::<bool>().ok())
        .unwrap_or(fallback))
}

/// Parse a `"points:value"` conversion into value per point.
pub fn parse_conversion(text: &str) -> Option<Decimal> {
    let (points, value) = text.split_once(':')?;
    let points = points.trim().parse::<Decimal>().ok()?;
    let value = value.trim().parse::<Decimal>().ok()?;
    if points <= Decimal::ZERO || value <= Decimal::ZERO {
        return None;
    }
    value.checked_div(points)
}

/// Value per point for a conversion setting.
pub async fn conversion_rate(tx: &mut dyn LedgerTx, key: &str, fallback: &str) -> Result<Decimal> {
    let text = tx.setting(key).await?.unwrap_or_else(|| fallback.to_string());
    parse_conversion(&text)
        .or_else(|| parse_conversion(fallback))
        .ok_or_else(|| LedgerError::Configuration(format!("invalid conversion for {key}: {text}")))
}

/// Store a setting after validating its shape.
pub async fn put_setting(tx: &mut dyn LedgerTx, key: &str, value: &str) -> Result<()> {
    let valid = match key {
        POINT_TO_BTC_RATE | POINT_TO_GIFT_RATE => parse_conversion(value).is_some(),
        BASE_DOLLAR => value.trim().parse::<Decimal>().is_ok_and(|v| v > Decimal::ZERO),
        GLOBAL_MINING_RATE => value
            .trim()
            .parse::<Decimal>()
            .is_ok_and(|v| v > Decimal::ZERO && v <= Decimal::ONE),
        REFERRAL_REWARD_ENABLED => value.trim().parse::<bool>().is_ok(),
        REFERRER_REWARD_AMOUNT | REFERRAL_REWARD_AMOUNT => value
            .trim()
            .parse::<Decimal>()
            .is_ok_and(|v| v >= Decimal::ZERO),
        _ => true,
    };
    if !valid {
        return Err(LedgerError::Configuration(format!(
            "invalid value for {key}: {value}"
        )));
    }
    tx.put_setting(key, value.trim()).await?;
    Ok(())
}
