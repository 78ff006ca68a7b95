//! Ledger domain records.
//!
//! Plain data carried between the engines and the store. Status-like enums
//! are stored as lowercase text and generated by [`stored_enum!`].

/// Declares a fieldless enum with a fixed text form used for storage.
///
/// Generates `as_str`, `parse`, `Display`, `FromStr` and comparisons with
/// `str` so stored values can be matched without allocating.
macro_rules! stored_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        $vis enum $name {
            $($variant),+
        }

        impl $name {
            /// Get the string representation stored for this value.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// Parse a stored value, returning `None` for unknown text.
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s).ok_or_else(|| format!("invalid {}: {}", stringify!($name), s))
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.as_str() == other
            }
        }

        impl PartialEq<$name> for str {
            fn eq(&self, other: &$name) -> bool {
                self == other.as_str()
            }
        }
    };
}

mod account;
mod fraud;
mod ledger;
mod mining;
mod payout;
mod pending;

pub use account::{Account, AccountId, AccountStatus, NewAccount, Role};
pub use fraud::{DeviceRecord, FraudAction, FraudFlag, FraudRule, FraudScan, RuleKey};
pub use ledger::{AuditEntry, EntryKind, LedgerEntry, NewAudit, Posting, ProcessedTransaction};
pub use mining::{Deposit, DepositId, DepositStatus, MiningSession, NewDeposit, NewSession, SessionId};
pub use payout::{NewPayout, PayoutId, PayoutKind, PayoutRequest, PayoutStatus};
pub use pending::{NewPending, PendingId, PendingPoint, PendingStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_enum_text_forms() {
        assert_eq!(PendingStatus::NegativePending.as_str(), "negative_pending");
        assert_eq!(
            PendingStatus::parse("chargeback_deducted"),
            Some(PendingStatus::ChargebackDeducted)
        );
        assert!(AccountStatus::Suspended == *"suspended");
        assert_eq!("flag_and_block".parse::<FraudAction>(), Ok(FraudAction::FlagAndBlock));
        assert!(DepositStatus::parse("unknown").is_none());
    }
}
