//! Store-backed sliding-window rate limiter.
//!
//! Hits are rows in the ledger store, so every instance sharing the store
//! sees the same window. A refused attempt is not recorded.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{LedgerError, Result};
use crate::storage::LedgerStore;
use crate::utils::retry::with_conflict_retry;

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn LedgerStore>,
    window: Duration,
    max_hits: i64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn LedgerStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            window: Duration::seconds(config.window_secs.min(u64::from(u32::MAX)) as i64),
            max_hits: config.max_hits.max(1),
        }
    }

    /// Count `key` against its window, failing with
    /// [`LedgerError::RateLimited`] once the window is full.
    pub async fn check(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        with_conflict_retry("rate_limit", move || self.check_once(key, now)).await
    }

    async fn check_once(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let hits = tx.count_hits(key, now - self.window).await?;
        if hits >= self.max_hits {
            warn!(key, hits, max = self.max_hits, "Rate limit exceeded");
            return Err(LedgerError::RateLimited {
                key: key.to_string(),
            });
        }
        tx.insert_hit(key, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop hits that can no longer fall inside any window.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.store.begin().await?;
        let removed = tx.prune_hits(now - self.window).await?;
        tx.commit().await?;
        if removed > 0 {
            debug!(removed, "Pruned expired rate-limit hits");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLedgerStore;
    use chrono::TimeZone;

    fn limiter(max_hits: i64) -> (RateLimiter, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let config = RateLimitConfig {
            window_secs: 60,
            max_hits,
        };
        (RateLimiter::new(store.clone(), &config), store)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_refuses_when_window_is_full() {
        let (limiter, _) = limiter(3);

        for _ in 0..3 {
            limiter.check("login:10.0.0.1", t0()).await.unwrap();
        }
        let err = limiter.check("login:10.0.0.1", t0()).await.unwrap_err();
        assert_eq!(err.http_status(), 429);

        limiter.check("login:10.0.0.2", t0()).await.unwrap();
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (limiter, _) = limiter(2);

        limiter.check("signup", t0()).await.unwrap();
        limiter.check("signup", t0() + Duration::seconds(30)).await.unwrap();
        assert!(limiter.check("signup", t0() + Duration::seconds(59)).await.is_err());

        limiter.check("signup", t0() + Duration::seconds(61)).await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_removes_only_expired_hits() {
        let (limiter, store) = limiter(10);
        limiter.check("k", t0()).await.unwrap();
        limiter.check("k", t0() + Duration::seconds(90)).await.unwrap();

        assert_eq!(limiter.prune(t0() + Duration::seconds(100)).await.unwrap(), 1);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.count_hits("k", t0()).await.unwrap(), 1);
    }
}
