//! Ledger, provider, scheduler and rate-limit configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::asset::Asset;
use crate::webhook::Provider;

/// Monetary defaults. Values that admins tune at runtime live in the settings
/// table; these are the fallbacks when a setting is absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Platform points credited per 1 USD of provider reward.
    pub base_dollar_rate: Decimal,
    /// Seconds a pending reward waits for a reversal before promotion.
    pub pending_cooldown_secs: u64,
    /// Fraction of a deposit mined per 24h when no personal rate is set.
    pub global_mining_rate: Decimal,
    /// USD quotes used to value deposits.
    pub usd_quotes: UsdQuotes,
    /// `"points:btc"` conversion for BTC redemptions.
    pub point_to_btc_rate: String,
    /// `"points:usd"` conversion for gift-card redemptions.
    pub point_to_gift_rate: String,
    pub referral: ReferralConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_dollar_rate: dec!(1.0),
            pending_cooldown_secs: 120,
            global_mining_rate: dec!(0.70),
            usd_quotes: UsdQuotes::default(),
            point_to_btc_rate: "10000:0.00001".to_string(),
            point_to_gift_rate: "100:1".to_string(),
            referral: ReferralConfig::default(),
        }
    }
}

impl LedgerConfig {
    pub fn usd_quote(&self, asset: Asset) -> Decimal {
        match asset {
            Asset::Bitcoin => self.usd_quotes.btc,
            Asset::Ethereum => self.usd_quotes.eth,
            Asset::Points => Decimal::ZERO,
        }
    }
}

/// USD price per unit of each crypto asset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsdQuotes {
    pub btc: Decimal,
    pub eth: Decimal,
}

impl Default for UsdQuotes {
    fn default() -> Self {
        Self {
            btc: dec!(50000),
            eth: dec!(3000),
        }
    }
}

/// Signup referral rewards. The enabled flag and both amounts can be
/// overridden at runtime through settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    pub enabled: bool,
    /// Asset both rewards are paid in.
    pub asset: Asset,
    /// Credited to the account whose code was used.
    pub referrer_amount: Decimal,
    /// Credited to the new account.
    pub referee_amount: Decimal,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            asset: Asset::Bitcoin,
            referrer_amount: dec!(0.001),
            referee_amount: dec!(0.001),
        }
    }
}

/// Shared secret and unit conventions for one webhook provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Signing secret (app secret, postback key or hash key).
    pub secret: String,
    /// Provider points per USD when the callback omits it.
    pub raw_unit: Option<Decimal>,
}

/// Per-provider configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub bitlabs: ProviderConfig,
    pub cpx_research: ProviderConfig,
    pub adgem: ProviderConfig,
    /// Secret for AdGem's player ban notifications.
    pub adgem_ban_secret: String,
}

impl ProvidersConfig {
    pub fn for_provider(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::BitLabs => &self.bitlabs,
            Provider::CpxResearch => &self.cpx_research,
            Provider::AdGem => &self.adgem,
        }
    }
}

/// Background job cadence for the worker binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub accrual_interval_secs: u64,
    pub promoter_interval_secs: u64,
    pub fraud_sweep_interval_secs: u64,
    pub rate_limit_prune_interval_secs: u64,
    /// Rows handled per unit of work inside one sweep.
    pub batch_size: u64,
    /// Lease lifetime; should exceed the longest job run.
    pub lease_ttl_secs: u64,
    /// Identifier of this worker; random when empty.
    pub worker_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            accrual_interval_secs: 60,
            promoter_interval_secs: 60,
            fraud_sweep_interval_secs: 3600,
            rate_limit_prune_interval_secs: 300,
            batch_size: 100,
            lease_ttl_secs: 55,
            worker_id: String::new(),
        }
    }
}

/// Store-backed sliding window limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_hits: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_hits: 30,
        }
    }
}
