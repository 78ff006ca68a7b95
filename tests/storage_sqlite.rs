//! SQLite ledger store integration tests.
//!
//! Run with: cargo test --test storage_sqlite --features sqlite
//!
//! Uses an in-memory database for the engine tests and a temporary file for
//! the concurrency tests, no external dependencies required.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::sqlite::SqlitePoolOptions;

use rewards_ledger::config::{Config, SqliteConfig};
use rewards_ledger::fraud::DeviceContext;
use rewards_ledger::model::{
    AccountId, AccountStatus, EntryKind, FraudAction, NewAccount, PayoutKind, PendingStatus, Role,
};
use rewards_ledger::services::settings::{put_setting, BASE_DOLLAR};
use rewards_ledger::services::{HistoryQuery, LedgerServices};
use rewards_ledger::storage::{LedgerStore, SqliteLedgerStore};
use rewards_ledger::webhook::signature::sign;
use rewards_ledger::webhook::{Callback, WebhookOutcome, WebhookRequest};
use rewards_ledger::{Asset, LedgerError};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// One connection, so every unit of work sees the same in-memory database.
async fn memory_store() -> Arc<SqliteLedgerStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to connect to SQLite");
    let store = SqliteLedgerStore::new(pool);
    store.init().await.expect("Failed to create tables");
    Arc::new(store)
}

async fn seed_account(store: &dyn LedgerStore, email: &str, role: Role) -> AccountId {
    let mut tx = store.begin().await.unwrap();
    let account = tx
        .insert_account(&NewAccount {
            email: email.to_string(),
            role,
            status: AccountStatus::Approved,
            signup_fingerprint: None,
            created_at: t0(),
        })
        .await
        .unwrap();
    put_setting(tx.as_mut(), BASE_DOLLAR, "100").await.unwrap();
    tx.commit().await.unwrap();
    account.id
}

fn cpx_request(pairs: &[(&str, &str)]) -> WebhookRequest {
    let mut request = WebhookRequest::from_params(pairs.iter().copied());
    let hash = sign::cpx(&request.params, "cpx-secret");
    request.params.insert("hash".to_string(), hash);
    request
}

async fn points(store: &dyn LedgerStore, account_id: AccountId) -> Decimal {
    let mut tx = store.begin().await.unwrap();
    tx.balance(account_id, Asset::Points).await.unwrap()
}

#[tokio::test]
async fn test_sqlite_webhook_to_spendable_points() {
    let store = memory_store().await;
    let account = seed_account(store.as_ref(), "worker@example.com", Role::User).await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());

    let completion = cpx_request(&[
        ("status", "1"),
        ("trans_id", "SQL-1"),
        ("user_id", &account.to_string()),
        ("VAL", "600"),
        ("RAW", "60"),
    ]);
    let response = services
        .webhooks
        .handle(Callback::CpxResearch, &completion, t0())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["points"], "1000.00");

    let replay = services
        .webhooks
        .process(Callback::CpxResearch, &completion, t0())
        .await
        .unwrap();
    assert_eq!(replay, WebhookOutcome::Duplicate { tx_id: "SQL-1".to_string() });

    // Nothing is due before the cooldown elapses.
    let early = services.promoter.promote_due(t0() + Duration::seconds(60), 100).await.unwrap();
    assert_eq!(early.promoted, 0);
    assert_eq!(points(store.as_ref(), account).await, Decimal::ZERO);

    let report = services.promoter.promote_due(t0() + Duration::days(31), 100).await.unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(points(store.as_ref(), account).await, dec!(1000.00));

    let again = services.promoter.promote_due(t0() + Duration::days(32), 100).await.unwrap();
    assert_eq!(again.promoted, 0);
    assert_eq!(points(store.as_ref(), account).await, dec!(1000.00));
}

#[tokio::test]
async fn test_sqlite_reversal_and_negative_pending() {
    let store = memory_store().await;
    let account = seed_account(store.as_ref(), "reversal@example.com", Role::User).await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());
    let user = account.to_string();

    let credit = cpx_request(&[
        ("status", "1"),
        ("trans_id", "R-1"),
        ("user_id", &user),
        ("amount_usd", "3"),
        ("offer_id", "OF-1"),
    ]);
    services.webhooks.process(Callback::CpxResearch, &credit, t0()).await.unwrap();
    let reversal = cpx_request(&[
        ("status", "2"),
        ("trans_id", "R-1-rev"),
        ("user_id", &user),
        ("offer_id", "OF-1"),
    ]);
    let outcome = services.webhooks.process(Callback::CpxResearch, &reversal, t0()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Reversed { matched: true, .. }));

    let orphan = cpx_request(&[
        ("status", "2"),
        ("trans_id", "R-2-rev"),
        ("user_id", &user),
        ("amount_usd", "1"),
    ]);
    let outcome = services.webhooks.process(Callback::CpxResearch, &orphan, t0()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Reversed { matched: false, .. }));

    let entries = services.rewards.pending_entries(account).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].status, PendingStatus::ChargebackDeducted);
    assert_eq!(entries[1].status, PendingStatus::NegativePending);
    assert_eq!(entries[1].amount, dec!(-100));

    // The next completion from the same source nets the outstanding deduction.
    let later = cpx_request(&[
        ("status", "1"),
        ("trans_id", "R-3"),
        ("user_id", &user),
        ("amount_usd", "5"),
    ]);
    let outcome = services.webhooks.process(Callback::CpxResearch, &later, t0()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Credited { netted, .. } if netted == dec!(100)));
}

#[tokio::test]
async fn test_sqlite_deposit_mining_accrual() {
    let store = memory_store().await;
    let account = seed_account(store.as_ref(), "miner@example.com", Role::User).await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());

    let deposit = services
        .deposits
        .create_deposit(account, Asset::Bitcoin, dec!(1.0), t0())
        .await
        .unwrap();
    services.deposits.submit_deposit(deposit.id, "txid:1", t0()).await.unwrap();
    let (_, session) = services.deposits.confirm_deposit(deposit.id, t0()).await.unwrap();

    let half_day = services.accrual.sweep(t0() + Duration::hours(12), 10).await.unwrap();
    assert_eq!(half_day.credited, 1);
    let progress = services
        .accrual
        .live_progress(session.id, t0() + Duration::hours(12))
        .await
        .unwrap();
    assert_eq!(progress.mined_amount, dec!(0.35));

    services.accrual.sweep(t0() + Duration::hours(48), 10).await.unwrap();
    let progress = services
        .accrual
        .live_progress(session.id, t0() + Duration::hours(72))
        .await
        .unwrap();
    assert_eq!(progress.mined_amount, dec!(0.70));

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.balance(account, Asset::Bitcoin).await.unwrap(), dec!(1.70));
}

#[tokio::test]
async fn test_sqlite_fraud_rules_block_fourth_device() {
    let store = memory_store().await;
    let account = seed_account(store.as_ref(), "devices@example.com", Role::User).await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());
    services.fraud.init_default_rules(t0()).await.unwrap();
    services
        .fraud
        .update_rule("max_devices_per_user", 3, FraudAction::FlagAndBlock, t0())
        .await
        .unwrap();

    for n in 1..=3 {
        let device = DeviceContext::new(format!("fp-{n}"), "203.0.113.5");
        services.accounts.track_device(account, &device, t0()).await.unwrap();
    }
    let fourth = DeviceContext::new("fp-4", "203.0.113.5");
    let result = services.accounts.track_device(account, &fourth, t0()).await;
    assert!(matches!(result, Err(LedgerError::Blocked { .. })));

    let suspended = services.accounts.account(account).await.unwrap();
    assert_eq!(suspended.status, AccountStatus::Suspended);
    assert!(suspended.is_flagged);
    assert_eq!(services.fraud.list_flags().await.unwrap().len(), 1);

    let cleared = services.fraud.clear_fraud_flag(account, t0()).await.unwrap();
    assert!(!cleared.is_flagged);
    assert!(services.fraud.list_flags().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sqlite_transfer_and_redemption() {
    let store = memory_store().await;
    let alice = seed_account(store.as_ref(), "alice@example.com", Role::User).await;
    let bob = seed_account(store.as_ref(), "bob@example.com", Role::User).await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());

    services
        .rewards
        .credit_pending(alice, "survey", Some("S-1"), dec!(5000), t0())
        .await
        .unwrap();
    services.promoter.promote_due(t0() + Duration::days(31), 10).await.unwrap();

    services
        .transfers
        .transfer(alice, "bob@example.com", Asset::Points, dec!(1500), t0())
        .await
        .unwrap();
    assert_eq!(points(store.as_ref(), alice).await, dec!(3500));
    assert_eq!(points(store.as_ref(), bob).await, dec!(1500));

    let gift = services
        .payouts
        .request_redemption(bob, PayoutKind::GiftCardRedemption, dec!(1000), None, t0())
        .await
        .unwrap();
    assert_eq!(gift.value, dec!(10));
    services.payouts.reject_payout(gift.id, t0()).await.unwrap();
    assert_eq!(points(store.as_ref(), bob).await, dec!(1500));
}

/// File-backed store shared by several connections.
async fn file_store(dir: &tempfile::TempDir) -> Arc<SqliteLedgerStore> {
    let config = SqliteConfig {
        path: dir.path().join("ledger.db").to_string_lossy().into_owned(),
        busy_timeout_ms: 5_000,
        max_connections: 4,
    };
    let store = Arc::new(SqliteLedgerStore::connect(&config).await.unwrap());
    store.init().await.unwrap();
    store
}

#[tokio::test]
async fn test_sqlite_concurrent_duplicate_deliveries_credit_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir).await;
    let account = seed_account(store.as_ref(), "racer@example.com", Role::User).await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());

    let request = cpx_request(&[
        ("status", "1"),
        ("trans_id", "RACE-1"),
        ("user_id", &account.to_string()),
        ("amount_usd", "4"),
    ]);

    let mut deliveries = Vec::new();
    for _ in 0..4 {
        let webhooks = services.webhooks.clone();
        let request = request.clone();
        deliveries.push(tokio::spawn(async move {
            webhooks.process(Callback::CpxResearch, &request, t0()).await
        }));
    }

    let mut credited = 0;
    for outcome in futures::future::join_all(deliveries).await {
        match outcome.unwrap().unwrap() {
            WebhookOutcome::Credited { .. } => credited += 1,
            WebhookOutcome::Duplicate { .. } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(credited, 1);
    let entries = services.rewards.pending_entries(account).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, dec!(400));
}

#[tokio::test]
async fn test_sqlite_concurrent_devices_respect_the_device_limit() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir).await;
    let account = seed_account(store.as_ref(), "swarm@example.com", Role::User).await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());
    services.fraud.init_default_rules(t0()).await.unwrap();
    services
        .fraud
        .update_rule("max_devices_per_user", 3, FraudAction::FlagAndBlock, t0())
        .await
        .unwrap();

    let mut attempts = Vec::new();
    for n in 1..=6 {
        let accounts = services.accounts.clone();
        attempts.push(tokio::spawn(async move {
            let device = DeviceContext::new(format!("swarm-{n}"), "198.51.100.7");
            accounts.track_device(account, &device, t0()).await
        }));
    }

    let mut allowed = 0;
    let mut blocked = 0;
    for result in futures::future::join_all(attempts).await {
        match result.unwrap() {
            Ok(()) => allowed += 1,
            Err(LedgerError::Blocked { .. }) => blocked += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(allowed, 3);
    assert_eq!(blocked, 3);
    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.count_fingerprints(account).await.unwrap(), 3);
    drop(tx);
    assert!(services.accounts.account(account).await.unwrap().is_flagged);
}

#[tokio::test]
async fn test_sqlite_promotion_batches_and_account_audit() {
    let store = memory_store().await;
    let account = seed_account(store.as_ref(), "batches@example.com", Role::User).await;
    let other = seed_account(store.as_ref(), "bystander@example.com", Role::User).await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());

    for n in 1..=5 {
        services
            .rewards
            .credit_pending(account, "survey", Some(&format!("B-{n}")), dec!(100), t0())
            .await
            .unwrap();
    }
    let report = services.promoter.promote_due(t0() + Duration::days(31), 2).await.unwrap();
    assert_eq!(report.promoted, 5);
    assert_eq!(report.total, dec!(500));
    assert_eq!(points(store.as_ref(), account).await, dec!(500));

    services.accounts.suspend_withdrawals(account, t0()).await.unwrap();
    services.accounts.suspend_withdrawals(other, t0()).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let audit = tx.audit_entries(Some(account)).await.unwrap();
    assert!(!audit.is_empty());
    assert!(audit.iter().all(|entry| entry.account_id == Some(account)));
    assert!(audit.iter().any(|entry| entry.category == "WITHDRAWALS_SUSPENDED"));
    assert!(tx.audit_entries(None).await.unwrap().len() > audit.len());
}

#[tokio::test]
async fn test_sqlite_referrals_holds_and_history() {
    let store = memory_store().await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());

    let referrer = services
        .accounts
        .signup("host@example.com", Role::User, &DeviceContext::new("fp-host", "10.1.0.1"), t0())
        .await
        .unwrap();
    let code = referrer.referral_code.clone().unwrap();
    let referee = services
        .accounts
        .signup_with_referral(
            "guest@example.com",
            Role::User,
            Some(&code),
            &DeviceContext::new("fp-guest", "10.1.0.2"),
            t0(),
        )
        .await
        .unwrap();
    assert_eq!(referee.referred_by, Some(referrer.id));
    assert_eq!(services.accounts.referrals(referrer.id).await.unwrap().len(), 1);
    assert_eq!(services.accounts.pay_referral(referee.id, t0()).await.unwrap(), None);

    let rewards = HistoryQuery {
        kind: Some(EntryKind::ReferralReward),
        ..HistoryQuery::default()
    };
    let history = services.history.transaction_history(referrer.id, &rewards).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].asset, Asset::Bitcoin);

    let held = services.accounts.suspend_withdrawals(referee.id, t0()).await.unwrap();
    assert!(held.withdrawals_suspended);
    assert!(services.accounts.account(referee.id).await.unwrap().withdrawals_suspended);
    let released = services.accounts.enable_withdrawals(referee.id, t0()).await.unwrap();
    assert!(!released.withdrawals_suspended);

    assert_eq!(services.accrual.pause_account(referrer.id, t0()).await.unwrap(), 0);
    assert!(services.accounts.account(referrer.id).await.unwrap().mining_paused);
    services.accrual.resume_account(referrer.id, t0()).await.unwrap();
    assert!(!services.accounts.account(referrer.id).await.unwrap().mining_paused);

    let summary = services.history.transaction_summary(referee.id, 7, t0()).await.unwrap();
    assert_eq!(summary.daily.len(), 7);
    assert_eq!(summary.by_kind.len(), 1);
    assert_eq!(summary.by_kind[0].kind, EntryKind::ReferralReward);
}

/// Open pending amounts, negative entries included.
async fn open_pending(services: &LedgerServices, account_id: AccountId) -> Decimal {
    services
        .rewards
        .pending_entries(account_id)
        .await
        .unwrap()
        .iter()
        .filter(|entry| matches!(entry.status, PendingStatus::Pending | PendingStatus::NegativePending))
        .map(|entry| entry.amount)
        .sum()
}

#[tokio::test]
async fn test_sqlite_pending_and_spendable_conserve_earnings() {
    let store = memory_store().await;
    let account = seed_account(store.as_ref(), "conserve@example.com", Role::User).await;
    let services = LedgerServices::new(store.clone(), &Config::for_test());
    let user = account.to_string();

    enum Step<'a> {
        Deliver(Vec<(&'a str, &'a str)>),
        Promote,
    }
    let deliver = |pairs: &[(&'static str, &'static str)]| {
        let mut pairs: Vec<(&str, &str)> = pairs.iter().copied().collect();
        pairs.push(("user_id", user.as_str()));
        Step::Deliver(pairs)
    };
    // (step, points earned, points charged back)
    let steps = vec![
        (deliver(&[("status", "1"), ("trans_id", "C-1"), ("offer_id", "OF-1"), ("amount_usd", "5")]), dec!(500), dec!(0)),
        (deliver(&[("status", "1"), ("trans_id", "C-2"), ("offer_id", "OF-2"), ("amount_usd", "3")]), dec!(300), dec!(0)),
        (deliver(&[("status", "2"), ("trans_id", "C-2-rev"), ("offer_id", "OF-2")]), dec!(0), dec!(300)),
        (deliver(&[("status", "2"), ("trans_id", "X-rev"), ("amount_usd", "1")]), dec!(0), dec!(100)),
        (deliver(&[("status", "1"), ("trans_id", "C-3"), ("amount_usd", "2")]), dec!(200), dec!(0)),
        (Step::Promote, dec!(0), dec!(0)),
        (deliver(&[("status", "2"), ("trans_id", "C-1-rev"), ("offer_id", "OF-1"), ("amount_usd", "1")]), dec!(0), dec!(100)),
    ];

    let mut earned = Decimal::ZERO;
    let mut charged_back = Decimal::ZERO;
    for (n, (step, gain, loss)) in steps.into_iter().enumerate() {
        match step {
            Step::Deliver(pairs) => {
                let outcome = services
                    .webhooks
                    .process(Callback::CpxResearch, &cpx_request(&pairs), t0())
                    .await
                    .unwrap();
                assert!(outcome.is_effect(), "step {n}: {outcome:?}");
            }
            Step::Promote => {
                services.promoter.promote_due(t0() + Duration::days(31), 100).await.unwrap();
            }
        }
        earned += gain;
        charged_back += loss;

        let pending = open_pending(&services, account).await;
        let spendable = points(store.as_ref(), account).await;
        assert_eq!(pending + spendable, earned - charged_back, "step {n}");
    }

    assert_eq!(points(store.as_ref(), account).await, dec!(600));
    assert_eq!(open_pending(&services, account).await, dec!(-100));
}
