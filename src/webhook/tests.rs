use super::signature::sign;
use super::*;
use crate::config::Config;
use crate::model::{AccountStatus, NewAccount, PendingStatus, Role};
use crate::storage::{LedgerStore, MemoryLedgerStore};
use crate::services::settings::{put_setting, BASE_DOLLAR};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;

const CALLBACK_BASE: &str = "https://ledger.example/api/bitlabs/callback";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

async fn setup() -> (WebhookEngine, Arc<MemoryLedgerStore>) {
    let store = Arc::new(MemoryLedgerStore::new());
    {
        let mut tx = store.begin().await.unwrap();
        for email in ["first@example.com", "second@example.com"] {
            tx.insert_account(&NewAccount {
                email: email.to_string(),
                role: Role::User,
                status: AccountStatus::Approved,
                signup_fingerprint: None,
                created_at: now(),
            })
            .await
            .unwrap();
        }
        put_setting(tx.as_mut(), BASE_DOLLAR, "100").await.unwrap();
        tx.commit().await.unwrap();
    }
    let config = Config::for_test();
    let engine = WebhookEngine::new(store.clone(), config.ledger, config.providers);
    (engine, store)
}

fn cpx_request(pairs: &[(&str, &str)]) -> WebhookRequest {
    let mut request = WebhookRequest::from_params(pairs.iter().copied());
    let hash = sign::cpx(&request.params, "cpx-secret");
    request.params.insert("hash".to_string(), hash);
    request
}

fn adgem_request(pairs: &[(&str, &str)]) -> WebhookRequest {
    let mut request = WebhookRequest::from_params(pairs.iter().copied());
    let verifier = sign::adgem(&request.params, "adgem-secret");
    request.params.insert("verifier".to_string(), verifier);
    request
}

fn bitlabs_request(path: &str, query: &str) -> WebhookRequest {
    let payload = format!("{path}?{query}");
    let hash = sign::bitlabs(&payload, "bitlabs-secret");
    WebhookRequest::from_url(&format!("{payload}&hash={hash}")).unwrap()
}

async fn pending(store: &MemoryLedgerStore, account_id: AccountId) -> Vec<crate::model::PendingPoint> {
    let mut tx = store.begin().await.unwrap();
    tx.pending_for(account_id).await.unwrap()
}

async fn spendable(store: &MemoryLedgerStore, account_id: AccountId) -> Decimal {
    let mut tx = store.begin().await.unwrap();
    tx.balance(account_id, crate::asset::Asset::Points).await.unwrap()
}

#[tokio::test]
async fn test_cpx_completion_is_credited_as_pending() {
    let (engine, store) = setup().await;
    let request = cpx_request(&[
        ("status", "1"),
        ("trans_id", "ABC123"),
        ("user_id", "1"),
        ("VAL", "600"),
        ("RAW", "60"),
        ("offer_id", "OFFER-1"),
    ]);

    let response = engine.handle(Callback::CpxResearch, &request, now()).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body["points"], "1000.00");
    let entries = pending(&store, 1).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, dec!(1000.00));
    assert_eq!(entries[0].status, PendingStatus::Pending);
    assert_eq!(entries[0].source, "cpx_research_survey");
    assert_eq!(entries[0].external_ref.as_deref(), Some("OFFER-1"));
    assert_eq!(spendable(&store, 1).await, Decimal::ZERO);
}

#[tokio::test]
async fn test_duplicate_delivery_has_one_effect() {
    let (engine, store) = setup().await;
    let request = cpx_request(&[
        ("status", "1"),
        ("trans_id", "DUP-1"),
        ("user_id", "1"),
        ("amount_usd", "2"),
    ]);

    let first = engine.process(Callback::CpxResearch, &request, now()).await.unwrap();
    let second = engine.process(Callback::CpxResearch, &request, now()).await.unwrap();
    let third = engine.process(Callback::CpxResearch, &request, now()).await.unwrap();

    assert!(matches!(first, WebhookOutcome::Credited { amount, .. } if amount == dec!(200)));
    assert_eq!(second, WebhookOutcome::Duplicate { tx_id: "DUP-1".to_string() });
    assert_eq!(third, second);
    assert_eq!(pending(&store, 1).await.len(), 1);
}

#[tokio::test]
async fn test_invalid_signature_is_rejected_without_state() {
    let (engine, store) = setup().await;
    let mut request = cpx_request(&[("status", "1"), ("trans_id", "BAD"), ("user_id", "1"), ("VAL", "60")]);
    request.params.insert("VAL".to_string(), "60000".to_string());

    let response = engine.handle(Callback::CpxResearch, &request, now()).await.unwrap();
    assert_eq!(response.status, 401);
    assert_eq!(response.body["status"], "ignored");

    // The untampered delivery is still processed: no idempotency record was written.
    let genuine = cpx_request(&[("status", "1"), ("trans_id", "BAD"), ("user_id", "1"), ("VAL", "60")]);
    let outcome = engine.process(Callback::CpxResearch, &genuine, now()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Credited { .. }));
    assert_eq!(pending(&store, 1).await.len(), 1);
}

#[tokio::test]
async fn test_bitlabs_bad_hash_is_acknowledged() {
    let (engine, _) = setup().await;
    let request = WebhookRequest::from_url(&format!(
        "{CALLBACK_BASE}?UID=1&TX=T1&VAL=60&hash=0000"
    ))
    .unwrap();

    let response = engine.handle(Callback::BitLabsReward, &request, now()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["reason"], "Invalid signature/hash");
}

#[tokio::test]
async fn test_bitlabs_parameters_after_hash_are_rejected() {
    let (engine, store) = setup().await;
    let reward = bitlabs_request(CALLBACK_BASE, "UID=1&TX=BL-1&VAL=120&RAW=60");
    let outcome = engine.process(Callback::BitLabsReward, &reward, now()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Credited { amount, .. } if amount == dec!(200)));

    let raw_url = reward.raw_url.clone().unwrap();
    let tampered = WebhookRequest::from_url(&format!("{raw_url}&TX=BL-1-replay&USD=500")).unwrap();
    let outcome = engine.process(Callback::BitLabsReward, &tampered, now()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Rejected { .. }));

    let entries = pending(&store, 1).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, dec!(200));
}

#[tokio::test]
async fn test_bitlabs_parses_only_the_signed_prefix() {
    let (engine, store) = setup().await;
    let mut reward = bitlabs_request(CALLBACK_BASE, "UID=1&TX=BL-2&VAL=120&RAW=60");
    // A caller that merged extra values into the decoded map cannot change
    // what gets credited.
    reward.params.insert("USD".to_string(), "500".to_string());
    reward.params.insert("TX".to_string(), "BL-forged".to_string());

    let outcome = engine.process(Callback::BitLabsReward, &reward, now()).await.unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Credited { ref tx_id, amount, .. } if tx_id == "BL-2" && amount == dec!(200)
    ));
    assert_eq!(pending(&store, 1).await.len(), 1);
}

#[tokio::test]
async fn test_unknown_user_is_recorded_without_effect() {
    let (engine, store) = setup().await;
    let request = cpx_request(&[("status", "1"), ("trans_id", "NOUSER"), ("user_id", "999"), ("VAL", "60")]);

    let response = engine.handle(Callback::CpxResearch, &request, now()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["reason"], "user not found");

    let replay = engine.process(Callback::CpxResearch, &request, now()).await.unwrap();
    assert!(matches!(replay, WebhookOutcome::Duplicate { .. }));
    assert!(pending(&store, 1).await.is_empty());
}

#[tokio::test]
async fn test_cpx_user_matched_by_email() {
    let (engine, store) = setup().await;
    let request = cpx_request(&[
        ("status", "1"),
        ("trans_id", "MAIL-1"),
        ("user_id", "Second@Example.com"),
        ("amount_usd", "1.5"),
    ]);

    let outcome = engine.process(Callback::CpxResearch, &request, now()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Credited { account_id: 2, .. }));
    assert_eq!(pending(&store, 2).await[0].amount, dec!(150));
}

#[tokio::test]
async fn test_reversal_before_promotion_zeroes_pending() {
    let (engine, store) = setup().await;
    let complete = cpx_request(&[
        ("status", "1"),
        ("trans_id", "ABC123"),
        ("user_id", "1"),
        ("VAL", "600"),
        ("RAW", "60"),
        ("offer_id", "OFFER-1"),
    ]);
    let reverse = cpx_request(&[
        ("status", "2"),
        ("trans_id", "ABC123-R"),
        ("user_id", "1"),
        ("VAL", "600"),
        ("RAW", "60"),
        ("offer_id", "OFFER-1"),
    ]);

    engine.process(Callback::CpxResearch, &complete, now()).await.unwrap();
    let outcome = engine.process(Callback::CpxResearch, &reverse, now()).await.unwrap();

    assert!(matches!(
        outcome,
        WebhookOutcome::Reversed { matched: true, deducted, .. } if deducted == dec!(1000)
    ));
    let entries = pending(&store, 1).await;
    assert_eq!(entries[0].amount, Decimal::ZERO);
    assert_eq!(entries[0].status, PendingStatus::ChargebackDeducted);
    assert_eq!(spendable(&store, 1).await, Decimal::ZERO);
}

#[tokio::test]
async fn test_unmatched_reversal_records_negative_pending_and_nets_later() {
    let (engine, store) = setup().await;
    let reverse = adgem_request(&[
        ("status", "2"),
        ("transaction_id", "R-1"),
        ("player_id", "1"),
        ("payout", "3"),
        ("offer_id", "GONE"),
    ]);
    let complete = adgem_request(&[
        ("status", "1"),
        ("transaction_id", "C-1"),
        ("player_id", "1"),
        ("payout", "5"),
        ("offer_id", "NEW"),
    ]);

    let reversed = engine.process(Callback::AdGem, &reverse, now()).await.unwrap();
    assert!(matches!(reversed, WebhookOutcome::Reversed { matched: false, .. }));

    let entries = pending(&store, 1).await;
    assert_eq!(entries[0].amount, dec!(-300));
    assert_eq!(entries[0].status, PendingStatus::NegativePending);
    assert_eq!(spendable(&store, 1).await, Decimal::ZERO);

    let credited = engine.process(Callback::AdGem, &complete, now()).await.unwrap();
    assert!(matches!(
        credited,
        WebhookOutcome::Credited { amount, netted, .. } if amount == dec!(500) && netted == dec!(300)
    ));

    let entries = pending(&store, 1).await;
    assert_eq!(entries[0].amount, Decimal::ZERO);
    assert_eq!(entries[0].status, PendingStatus::ChargebackDeducted);
    assert_eq!(entries[1].amount, dec!(200));
    assert_eq!(entries[1].status, PendingStatus::Pending);
}

#[tokio::test]
async fn test_bitlabs_reward_and_reconcile() {
    let (engine, store) = setup().await;
    let reward = bitlabs_request(CALLBACK_BASE, "UID=1&TX=BL-1&VAL=120&RAW=60&EARNING_ID=E-1");

    let outcome = engine.process(Callback::BitLabsReward, &reward, now()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Credited { amount, .. } if amount == dec!(200)));

    let chargebacks = r#"[{"amount":"50","earning_id":"E-1","reason":"quality"},{"amount":"10","earning_id":"E-404"}]"#;
    let query = format!(
        "UID=1&TX=BL-RC-1&TYPE=bitlabs_reward&chargebacks={}",
        url::form_urlencoded::byte_serialize(chargebacks.as_bytes()).collect::<String>()
    );
    let reconcile = bitlabs_request("https://ledger.example/api/reconcile/earnings", &query);

    let outcome = engine.process(Callback::BitLabsReconcile, &reconcile, now()).await.unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Reconciled {
            tx_id: "BL-RC-1".to_string(),
            account_id: 1,
            processed: 2,
            total_deducted: dec!(60),
        }
    );

    let entries = pending(&store, 1).await;
    assert_eq!(entries[0].amount, dec!(150));
    assert_eq!(entries[0].status, PendingStatus::Pending);
    assert_eq!(entries[1].amount, dec!(-10));
    assert_eq!(entries[1].status, PendingStatus::NegativePending);

    let mut tx = store.begin().await.unwrap();
    let audit = tx.audit_entries(Some(1)).await.unwrap();
    assert_eq!(
        audit.iter().filter(|a| a.category == "CHARGEBACK_PROCESSED").count(),
        2
    );
}

#[tokio::test]
async fn test_malformed_reward_is_recorded_as_zero_credit() {
    let (engine, store) = setup().await;
    let request = adgem_request(&[("status", "1"), ("transaction_id", "Z-1"), ("player_id", "1"), ("amount", "lots")]);

    let outcome = engine.process(Callback::AdGem, &request, now()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Credited { amount, .. } if amount.is_zero()));
    assert!(pending(&store, 1).await.is_empty());

    let replay = engine.process(Callback::AdGem, &request, now()).await.unwrap();
    assert!(matches!(replay, WebhookOutcome::Duplicate { .. }));
}

#[tokio::test]
async fn test_failed_commit_leaves_transaction_unprocessed() {
    let (engine, store) = setup().await;
    let request = cpx_request(&[("status", "1"), ("trans_id", "RETRY-1"), ("user_id", "1"), ("VAL", "60")]);

    store.set_fail_on_commit(true).await;
    assert!(engine.process(Callback::CpxResearch, &request, now()).await.is_err());
    store.set_fail_on_commit(false).await;

    let outcome = engine.process(Callback::CpxResearch, &request, now()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Credited { .. }));
}

#[tokio::test]
async fn test_concurrent_duplicates_credit_once() {
    let (engine, store) = setup().await;
    let request = cpx_request(&[("status", "1"), ("trans_id", "RACE-1"), ("user_id", "1"), ("amount_usd", "1")]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let request = request.clone();
            tokio::spawn(async move { engine.process(Callback::CpxResearch, &request, now()).await })
        })
        .collect();

    let mut credited = 0;
    for handle in handles {
        if let WebhookOutcome::Credited { .. } = handle.await.unwrap().unwrap() {
            credited += 1;
        }
    }

    assert_eq!(credited, 1);
    assert_eq!(pending(&store, 1).await.len(), 1);
}

#[tokio::test]
async fn test_adgem_ban_notification() {
    let (engine, store) = setup().await;
    let body = r#"{"type":"player.banned","data":{"player_id":"2"}}"#;
    let signature = sign::adgem_ban(body.as_bytes(), "adgem-ban-secret");

    let rejected = engine.handle_ban(body, Some("nope"), now()).await.unwrap();
    assert_eq!(rejected.status, 401);

    let response = engine.handle_ban(body, Some(&signature), now()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["banned"], true);

    let mut tx = store.begin().await.unwrap();
    assert!(tx.account(2).await.unwrap().unwrap().is_banned);
}
