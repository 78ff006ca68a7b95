use super::*;
use crate::model::{AccountStatus, NewAccount, NewPending, Role};
use crate::storage::{LedgerTx, MemoryLedgerStore};
use chrono::TimeZone;
use rust_decimal_macros::dec;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

async fn seed(store: &MemoryLedgerStore, entries: &[(Decimal, PendingStatus, i64)]) -> AccountId {
    let mut tx = store.begin().await.unwrap();
    let account = tx
        .insert_account(&NewAccount {
            email: "earner@example.com".to_string(),
            role: Role::User,
            status: AccountStatus::Approved,
            signup_fingerprint: None,
            created_at: t0(),
        })
        .await
        .unwrap();
    for (i, (amount, status, offset_secs)) in entries.iter().enumerate() {
        tx.insert_pending(&NewPending {
            account_id: account.id,
            amount: *amount,
            source: "cpx_research_survey".to_string(),
            external_ref: Some(format!("offer-{i}")),
            earned_at: t0() + Duration::seconds(*offset_secs),
            status: *status,
        })
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();
    account.id
}

async fn spendable(store: &MemoryLedgerStore, account_id: AccountId) -> Decimal {
    let mut tx = store.begin().await.unwrap();
    tx.balance(account_id, Asset::Points).await.unwrap()
}

#[tokio::test]
async fn test_only_entries_past_cooldown_are_promoted() {
    let store = Arc::new(MemoryLedgerStore::new());
    let account = seed(
        &store,
        &[
            (dec!(100), PendingStatus::Pending, 0),
            (dec!(50), PendingStatus::Pending, 100),
        ],
    )
    .await;
    let promoter = PendingPromoter::new(store.clone(), 120);

    let report = promoter.promote_due(t0() + Duration::seconds(150), 10).await.unwrap();

    assert_eq!(report.promoted, 1);
    assert_eq!(report.total, dec!(100));
    assert_eq!(spendable(&store, account).await, dec!(100));
    assert_eq!(promoter.pending_balance(account).await.unwrap(), dec!(50));
}

#[tokio::test]
async fn test_promotion_is_not_repeated() {
    let store = Arc::new(MemoryLedgerStore::new());
    let account = seed(&store, &[(dec!(75.50), PendingStatus::Pending, 0)]).await;
    let promoter = PendingPromoter::new(store.clone(), 120);
    let later = t0() + Duration::minutes(10);

    promoter.promote_due(later, 10).await.unwrap();
    let second = promoter.promote_due(later, 10).await.unwrap();

    assert_eq!(second.promoted, 0);
    assert_eq!(spendable(&store, account).await, dec!(75.50));

    let mut tx = store.begin().await.unwrap();
    let entries = tx.pending_for(account).await.unwrap();
    assert_eq!(entries[0].status, PendingStatus::Cleared);
    assert_eq!(entries[0].resolved_at, Some(later));

    let ledger = tx.ledger_entries(account).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].kind, EntryKind::PendingCleared);
    assert_eq!(ledger[0].reference, pending_reference(entries[0].id));
}

#[tokio::test]
async fn test_non_pending_entries_are_left_alone() {
    let store = Arc::new(MemoryLedgerStore::new());
    let account = seed(
        &store,
        &[
            (dec!(-30), PendingStatus::NegativePending, 0),
            (dec!(0), PendingStatus::ChargebackDeducted, 0),
            (dec!(20), PendingStatus::Pending, 0),
        ],
    )
    .await;
    let promoter = PendingPromoter::new(store.clone(), 120);

    let report = promoter.promote_due(t0() + Duration::hours(1), 10).await.unwrap();

    assert_eq!(report.promoted, 1);
    assert_eq!(spendable(&store, account).await, dec!(20));

    let mut tx = store.begin().await.unwrap();
    let entries = tx.pending_for(account).await.unwrap();
    assert_eq!(entries[0].status, PendingStatus::NegativePending);
    assert_eq!(entries[0].amount, dec!(-30));
}

#[tokio::test]
async fn test_batches_drain_all_due_entries() {
    let store = Arc::new(MemoryLedgerStore::new());
    let entries: Vec<_> = (0..5).map(|i| (dec!(10), PendingStatus::Pending, i)).collect();
    let account = seed(&store, &entries).await;
    let promoter = PendingPromoter::new(store.clone(), 0);

    let report = promoter.promote_due(t0() + Duration::seconds(10), 2).await.unwrap();

    assert_eq!(report.promoted, 5);
    assert_eq!(spendable(&store, account).await, dec!(50));
}

#[tokio::test]
async fn test_failed_commit_keeps_entry_pending() {
    let store = Arc::new(MemoryLedgerStore::new());
    let account = seed(&store, &[(dec!(40), PendingStatus::Pending, 0)]).await;
    let promoter = PendingPromoter::new(store.clone(), 120);
    let later = t0() + Duration::hours(1);

    store.set_fail_on_commit(true).await;
    let report = promoter.promote_due(later, 10).await.unwrap();
    store.set_fail_on_commit(false).await;

    assert_eq!(report.failed, 1);
    assert_eq!(spendable(&store, account).await, Decimal::ZERO);
    assert_eq!(promoter.pending_balance(account).await.unwrap(), dec!(40));

    let retry = promoter.promote_due(later, 10).await.unwrap();
    assert_eq!(retry.promoted, 1);
    assert_eq!(spendable(&store, account).await, dec!(40));
}
