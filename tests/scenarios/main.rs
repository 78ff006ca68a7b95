//! Behavioral scenarios using cucumber-rs (Gherkin).
//!
//! Each scenario gets a fresh in-memory store and a fixed clock; steps move
//! the clock forward explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use cucumber::{given, then, when, World};
use rust_decimal::Decimal;

use rewards_ledger::config::Config;
use rewards_ledger::fraud::DeviceContext;
use rewards_ledger::model::{
    AccountId, AccountStatus, EntryKind, NewAccount, PendingStatus, Posting, Role, SessionId,
};
use rewards_ledger::services::settings::{put_setting, BASE_DOLLAR};
use rewards_ledger::services::LedgerServices;
use rewards_ledger::storage::{LedgerStore, MemoryLedgerStore};
use rewards_ledger::webhook::signature::sign;
use rewards_ledger::webhook::{Callback, WebhookRequest, WebhookResponse};
use rewards_ledger::{Asset, LedgerError};

/// Scenario state.
#[derive(World)]
#[world(init = Self::new)]
pub struct LedgerWorld {
    store: Arc<MemoryLedgerStore>,
    services: LedgerServices,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    accounts: HashMap<String, AccountId>,
    session: Option<SessionId>,
    last_request: Option<WebhookRequest>,
    last_response: Option<WebhookResponse>,
    last_error: Option<LedgerError>,
}

impl std::fmt::Debug for LedgerWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerWorld")
            .field("now", &self.now)
            .field("accounts", &self.accounts)
            .field("session", &self.session)
            .finish()
    }
}

impl LedgerWorld {
    async fn new() -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let services = LedgerServices::new(store.clone(), &Config::for_test());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Self {
            store,
            services,
            start,
            now: start,
            accounts: HashMap::new(),
            session: None,
            last_request: None,
            last_response: None,
            last_error: None,
        }
    }

    fn account(&self, email: &str) -> AccountId {
        *self
            .accounts
            .get(email)
            .unwrap_or_else(|| panic!("no account named {email} in this scenario"))
    }

    fn response(&self) -> &WebhookResponse {
        self.last_response
            .as_ref()
            .expect("no webhook has been delivered yet")
    }
}

fn decimal(text: &str) -> Decimal {
    text.parse()
        .unwrap_or_else(|_| panic!("not a decimal: {text}"))
}

fn asset(symbol: &str) -> Asset {
    symbol
        .parse()
        .unwrap_or_else(|_| panic!("unknown asset: {symbol}"))
}

// Accounts and balances

#[given(expr = "an approved account {string}")]
async fn given_approved_account(world: &mut LedgerWorld, email: String) {
    let mut tx = world.store.begin().await.unwrap();
    let account = tx
        .insert_account(&NewAccount {
            email: email.clone(),
            role: Role::User,
            status: AccountStatus::Approved,
            signup_fingerprint: None,
            created_at: world.now,
        })
        .await
        .unwrap();
    tx.commit().await.unwrap();
    world.accounts.insert(email, account.id);
}

#[given(expr = "{string} holds {string} {string}")]
async fn given_holding(world: &mut LedgerWorld, email: String, amount: String, symbol: String) {
    let account_id = world.account(&email);
    let mut tx = world.store.begin().await.unwrap();
    tx.post(&Posting {
        account_id,
        asset: asset(&symbol),
        amount: decimal(&amount),
        kind: EntryKind::Deposit,
        reference: "scenario-seed".to_string(),
        at: world.now,
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();
}

#[then(expr = "the {string} balance of {string} is {string}")]
async fn then_balance(world: &mut LedgerWorld, symbol: String, email: String, expected: String) {
    let account_id = world.account(&email);
    let mut tx = world.store.begin().await.unwrap();
    let balance = tx.balance(account_id, asset(&symbol)).await.unwrap();
    assert_eq!(balance, decimal(&expected), "{symbol} balance of {email}");
}

#[then(expr = "the total {string} across all accounts is {string}")]
async fn then_total(world: &mut LedgerWorld, symbol: String, expected: String) {
    let mut tx = world.store.begin().await.unwrap();
    let mut total = Decimal::ZERO;
    for account_id in world.accounts.values() {
        total += tx.balance(*account_id, asset(&symbol)).await.unwrap();
    }
    assert_eq!(total, decimal(&expected));
}

#[then(expr = "{string} is {string}")]
async fn then_status(world: &mut LedgerWorld, email: String, expected: String) {
    let account = world.services.accounts.account(world.account(&email)).await.unwrap();
    assert_eq!(account.status.to_string(), expected);
}

// Deposits and mining

#[given(expr = "a confirmed deposit of {string} {string} for {string}")]
async fn given_confirmed_deposit(world: &mut LedgerWorld, amount: String, symbol: String, email: String) {
    let account_id = world.account(&email);
    let deposits = &world.services.deposits;
    let deposit = deposits
        .create_deposit(account_id, asset(&symbol), decimal(&amount), world.now)
        .await
        .unwrap();
    deposits.submit_deposit(deposit.id, "txid:scenario", world.now).await.unwrap();
    let (_, session) = deposits.confirm_deposit(deposit.id, world.now).await.unwrap();
    world.session = Some(session.id);
}

#[when(expr = "mining is settled after {int} hours")]
async fn when_mining_settled(world: &mut LedgerWorld, hours: i64) {
    world.now = world.start + Duration::hours(hours);
    world.services.accrual.sweep(world.now, 100).await.unwrap();
}

#[then(expr = "the session has mined {string}")]
async fn then_session_mined(world: &mut LedgerWorld, expected: String) {
    let session_id = world.session.expect("no mining session in this scenario");
    let progress = world
        .services
        .accrual
        .live_progress(session_id, world.now)
        .await
        .unwrap();
    assert_eq!(progress.mined_amount, decimal(&expected));
}

// Provider webhooks

#[given(expr = "one dollar is worth {int} points")]
async fn given_base_dollar(world: &mut LedgerWorld, points: i64) {
    let mut tx = world.store.begin().await.unwrap();
    put_setting(tx.as_mut(), BASE_DOLLAR, &points.to_string()).await.unwrap();
    tx.commit().await.unwrap();
}

#[when(expr = "CPX Research delivers a signed callback for {string}:")]
async fn when_cpx_delivers(world: &mut LedgerWorld, email: String, step: &cucumber::gherkin::Step) {
    let table = step.table.as_ref().expect("callback parameters table");
    let user = world.account(&email).to_string();
    let mut request = WebhookRequest::from_params(
        table
            .rows
            .iter()
            .map(|row| (row[0].clone(), row[1].clone()))
            .chain(std::iter::once(("user_id".to_string(), user))),
    );
    let hash = sign::cpx(&request.params, "cpx-secret");
    request.params.insert("hash".to_string(), hash);

    let response = world
        .services
        .webhooks
        .handle(Callback::CpxResearch, &request, world.now)
        .await
        .unwrap();
    world.last_request = Some(request);
    world.last_response = Some(response);
}

#[when("the same callback is delivered again")]
async fn when_redelivered(world: &mut LedgerWorld) {
    let request = world.last_request.clone().expect("no earlier callback");
    let response = world
        .services
        .webhooks
        .handle(Callback::CpxResearch, &request, world.now)
        .await
        .unwrap();
    world.last_response = Some(response);
}

#[then(expr = "the callback is acknowledged with {string}")]
async fn then_acknowledged(world: &mut LedgerWorld, status: String) {
    let response = world.response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["status"], status.as_str());
}

#[then(expr = "the acknowledgment reports {string} points")]
async fn then_reports_points(world: &mut LedgerWorld, points: String) {
    assert_eq!(world.response().body["points"], points.as_str());
}

#[then("the acknowledgment marks it as a duplicate")]
async fn then_duplicate(world: &mut LedgerWorld) {
    assert_eq!(world.response().body["reason"], "duplicate");
}

#[then(expr = "{string} has {int} pending entry/entries")]
async fn then_pending_count(world: &mut LedgerWorld, email: String, count: usize) {
    let entries = world
        .services
        .rewards
        .pending_entries(world.account(&email))
        .await
        .unwrap();
    assert_eq!(entries.len(), count);
}

#[then(expr = "the latest pending entry of {string} is {string} marked {string}")]
async fn then_latest_pending(world: &mut LedgerWorld, email: String, amount: String, status: String) {
    let entries = world
        .services
        .rewards
        .pending_entries(world.account(&email))
        .await
        .unwrap();
    let latest = entries.last().expect("no pending entries");
    assert_eq!(latest.amount, decimal(&amount));
    let expected = PendingStatus::parse(&status).unwrap_or_else(|| panic!("unknown status {status}"));
    assert_eq!(latest.status, expected);
}

#[when(expr = "pending points are promoted after {int} minutes")]
async fn when_promoted(world: &mut LedgerWorld, minutes: i64) {
    world.now = world.start + Duration::minutes(minutes);
    world.services.promoter.promote_due(world.now, 100).await.unwrap();
}

// Fraud rules

#[given("the default fraud rules")]
async fn given_default_rules(world: &mut LedgerWorld) {
    world.services.fraud.init_default_rules(world.now).await.unwrap();
}

#[when(expr = "{string} logs in from device {string} at {string}")]
async fn when_login(world: &mut LedgerWorld, email: String, fingerprint: String, ip: String) {
    let device = DeviceContext::new(fingerprint, ip);
    world.last_error = world
        .services
        .accounts
        .login(&email, &device, world.now)
        .await
        .err();
}

#[then("the login succeeds")]
async fn then_login_succeeds(world: &mut LedgerWorld) {
    assert!(world.last_error.is_none(), "unexpected error: {:?}", world.last_error);
}

#[then(expr = "the login is refused with {string}")]
async fn then_login_refused(world: &mut LedgerWorld, expected: String) {
    let error = world.last_error.as_ref().expect("expected the login to be refused");
    assert!(matches!(error, LedgerError::Blocked { .. }), "got {error:?}");
    assert!(
        error.to_string().contains(&expected),
        "expected error containing '{expected}', got '{error}'"
    );
}

#[then(expr = "{string} has {int} known devices")]
async fn then_known_devices(world: &mut LedgerWorld, email: String, count: i64) {
    let account_id = world.account(&email);
    let mut tx = world.store.begin().await.unwrap();
    assert_eq!(tx.count_fingerprints(account_id).await.unwrap(), count);
}

// Transfers

#[when(expr = "{string} transfers {string} {string} to {string}")]
async fn when_transfer(world: &mut LedgerWorld, from: String, amount: String, symbol: String, to: String) {
    world.last_error = world
        .services
        .transfers
        .transfer(world.account(&from), &to, asset(&symbol), decimal(&amount), world.now)
        .await
        .err();
}

#[then("the transfer is refused for insufficient balance")]
async fn then_transfer_refused(world: &mut LedgerWorld) {
    assert!(matches!(
        world.last_error,
        Some(LedgerError::InsufficientBalance { .. })
    ));
}

#[tokio::main]
async fn main() {
    LedgerWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/scenarios/features")
        .await;
}
