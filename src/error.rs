//! Domain errors surfaced to callers of the ledger engines.

use rust_decimal::Decimal;

use crate::asset::Asset;
use crate::model::AccountId;
use crate::storage::StorageError;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Invalid rate {0}: must be greater than 0 and at most 1")]
    InvalidRate(Decimal),

    #[error("Invalid fraud rule: {0}")]
    InvalidRule(String),

    /// A fraud rule blocked the request (403-equivalent).
    #[error("Blocked: {reason}")]
    Blocked { reason: String },

    #[error("Account {0} is flagged for review")]
    AccountFlagged(AccountId),

    #[error("Withdrawals are suspended for account {0}")]
    WithdrawalsSuspended(AccountId),

    #[error("Account {account_id} is {status}")]
    AccountInactive { account_id: AccountId, status: String },

    #[error("Insufficient {asset} balance: available {available}, requested {requested}")]
    InsufficientBalance {
        asset: Asset,
        available: Decimal,
        requested: Decimal,
    },

    #[error("Cannot transfer to the same account")]
    SelfTransfer,

    #[error("Rate limit exceeded for {key}")]
    RateLimited { key: String },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP status an outer request layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::Blocked { .. }
            | LedgerError::AccountFlagged(_)
            | LedgerError::WithdrawalsSuspended(_)
            | LedgerError::AccountInactive { .. } => 403,
            LedgerError::NotFound { .. } => 404,
            LedgerError::InvalidState(_) => 409,
            LedgerError::RateLimited { .. } => 429,
            LedgerError::InvalidAmount(_)
            | LedgerError::InvalidRate(_)
            | LedgerError::InvalidRule(_)
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::SelfTransfer => 400,
            LedgerError::Storage(StorageError::InsufficientBalance { .. }) => 400,
            LedgerError::Storage(StorageError::Conflict(_)) => 503,
            LedgerError::Storage(_) | LedgerError::Configuration(_) => 500,
        }
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Storage(e) if e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_http_status_mapping() {
        let blocked = LedgerError::Blocked {
            reason: "too many devices".to_string(),
        };
        assert_eq!(blocked.http_status(), 403);
        assert_eq!(LedgerError::not_found("account", 7).http_status(), 404);
        assert_eq!(LedgerError::InvalidRate(dec!(1.5)).http_status(), 400);
        assert_eq!(
            LedgerError::RateLimited {
                key: "login:1.2.3.4".to_string()
            }
            .http_status(),
            429
        );
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(LedgerError::Storage(StorageError::Conflict("busy".to_string())).is_retryable());
        assert!(!LedgerError::SelfTransfer.is_retryable());
        assert!(!LedgerError::Storage(StorageError::Injected("commit")).is_retryable());
    }
}
