//! Reward units.
//!
//! Crypto assets and survey points share one accrual and posting path; the
//! only per-unit difference is the number of fractional digits kept.

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// A unit a balance can be held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    #[serde(rename = "BTC")]
    Bitcoin,
    #[serde(rename = "ETH")]
    Ethereum,
    Points,
}

impl Asset {
    pub const ALL: [Asset; 3] = [Asset::Bitcoin, Asset::Ethereum, Asset::Points];

    /// Returns the storage code of the asset.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Asset::Bitcoin => "BTC",
            Asset::Ethereum => "ETH",
            Asset::Points => "POINTS",
        }
    }

    /// Number of fractional digits in the asset's minimum unit.
    pub const fn scale(&self) -> u32 {
        match self {
            Asset::Bitcoin | Asset::Ethereum => 8,
            Asset::Points => 2,
        }
    }

    /// Floors `amount` to the asset's minimum unit (toward negative infinity).
    pub fn floor(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.scale(), RoundingStrategy::ToNegativeInfinity)
    }

    /// Smallest representable positive amount.
    pub fn unit(&self) -> Decimal {
        Decimal::new(1, self.scale())
    }

    pub const fn is_crypto(&self) -> bool {
        matches!(self, Asset::Bitcoin | Asset::Ethereum)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" | "BITCOIN" => Ok(Asset::Bitcoin),
            "ETH" | "ETHEREUM" => Ok(Asset::Ethereum),
            "POINTS" | "PTS" => Ok(Asset::Points),
            other => Err(format!("unknown asset: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_floor_never_rounds_up() {
        assert_eq!(Asset::Bitcoin.floor(dec!(0.123456789)), dec!(0.12345678));
        assert_eq!(Asset::Points.floor(dec!(10.999)), dec!(10.99));
        assert_eq!(Asset::Points.floor(dec!(-0.001)), dec!(-0.01));
    }

    #[test]
    fn test_parse_round_trips_storage_code() {
        for asset in Asset::ALL {
            assert_eq!(asset.as_str().parse::<Asset>(), Ok(asset));
        }
        assert!("DOGE".parse::<Asset>().is_err());
    }

    #[test]
    fn test_unit() {
        assert_eq!(Asset::Ethereum.unit(), dec!(0.00000001));
        assert_eq!(Asset::Points.unit(), dec!(0.01));
    }
}
