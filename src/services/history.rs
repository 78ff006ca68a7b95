//! Transaction history and summaries over the spendable-balance ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::load_account;
use crate::asset::Asset;
use crate::error::{LedgerError, Result};
use crate::model::{AccountId, EntryKind, LedgerEntry};
use crate::storage::LedgerStore;

/// Largest page a history read returns.
pub const MAX_PAGE: usize = 500;
/// Longest window a summary covers.
pub const MAX_SUMMARY_DAYS: u32 = 365;

/// Filter and page for [`HistoryService::transaction_history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub kind: Option<EntryKind>,
    pub asset: Option<Asset>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            kind: None,
            asset: None,
            since: None,
            until: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl HistoryQuery {
    fn matches(&self, entry: &LedgerEntry) -> bool {
        self.kind.is_none_or(|kind| entry.kind == kind)
            && self.asset.is_none_or(|asset| entry.asset == asset)
            && self.since.is_none_or(|since| entry.created_at >= since)
            && self.until.is_none_or(|until| entry.created_at <= until)
    }
}

/// Count and signed total of one entry kind in one asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindTotal {
    pub kind: EntryKind,
    pub asset: Asset,
    pub count: usize,
    pub total: Decimal,
}

/// Absolute amount moved per asset on one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyVolume {
    pub date: NaiveDate,
    pub volume: BTreeMap<Asset, Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionSummary {
    pub period_days: u32,
    pub since: DateTime<Utc>,
    pub by_kind: Vec<KindTotal>,
    /// One row per day of the period, most recent first; quiet days are empty.
    pub daily: Vec<DailyVolume>,
}

#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn LedgerStore>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Ledger entries of the account matching `query`, newest first.
    pub async fn transaction_history(&self, account_id: AccountId, query: &HistoryQuery) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries(account_id).await?;
        Ok(entries
            .into_iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .skip(query.offset)
            .take(query.limit.min(MAX_PAGE))
            .collect())
    }

    /// Per-kind totals and daily volume over the last `days` days.
    pub async fn transaction_summary(
        &self,
        account_id: AccountId,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<TransactionSummary> {
        if days == 0 || days > MAX_SUMMARY_DAYS {
            return Err(LedgerError::InvalidState(format!(
                "summary period must be between 1 and {MAX_SUMMARY_DAYS} days, got {days}"
            )));
        }
        let today = now.date_naive();
        let first_day = today - Duration::days(i64::from(days) - 1);
        let since = now - Duration::days(i64::from(days));

        let entries = self.entries(account_id).await?;

        let mut by_kind: BTreeMap<(&'static str, Asset), KindTotal> = BTreeMap::new();
        let mut daily: BTreeMap<NaiveDate, BTreeMap<Asset, Decimal>> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.created_at >= since && e.created_at <= now) {
            let total = by_kind
                .entry((entry.kind.as_str(), entry.asset))
                .or_insert_with(|| KindTotal {
                    kind: entry.kind,
                    asset: entry.asset,
                    count: 0,
                    total: Decimal::ZERO,
                });
            total.count += 1;
            total.total += entry.amount;

            let date = entry.created_at.date_naive();
            if date >= first_day {
                *daily
                    .entry(date)
                    .or_default()
                    .entry(entry.asset)
                    .or_insert(Decimal::ZERO) += entry.amount.abs();
            }
        }

        let daily = (0..i64::from(days))
            .map(|back| today - Duration::days(back))
            .map(|date| DailyVolume {
                date,
                volume: daily.remove(&date).unwrap_or_default(),
            })
            .collect();

        Ok(TransactionSummary {
            period_days: days,
            since,
            by_kind: by_kind.into_values().collect(),
            daily,
        })
    }

    async fn entries(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        let mut tx = self.store.begin().await?;
        load_account(tx.as_mut(), account_id).await?;
        Ok(tx.ledger_entries(account_id).await?)
    }
}
