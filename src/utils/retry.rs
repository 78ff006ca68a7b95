//! Retry utilities: backoff builders and conflict retries.
//!
//! Uses `backon` for exponential backoff with jitter. A unit of work that
//! loses a write race against another worker fails with a storage conflict;
//! the whole operation is re-run from a fresh transaction.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use crate::error::{LedgerError, Result};

/// Standard backoff for re-running a conflicted unit of work.
///
/// - Min delay: 5ms
/// - Max delay: 500ms
/// - Max attempts: 8
/// - Jitter enabled
pub fn ledger_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(8)
        .with_jitter()
}

/// Run `operation`, retrying while it fails with a retryable storage error.
///
/// `operation` must open and commit its own unit of work on every call.
pub async fn with_conflict_retry<T, F, Fut>(name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    operation
        .retry(ledger_backoff())
        .when(LedgerError::is_retryable)
        .notify(|err: &LedgerError, dur: Duration| {
            warn!(operation = %name, error = %err, delay = ?dur, "Unit of work conflicted, retrying");
        })
        .await
}
