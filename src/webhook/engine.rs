//! Webhook handling against the ledger store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{info, warn};

use super::payload::{self, CallbackAction, ParsedCallback, UserRef};
use super::reconcile::{record_completion, record_reversal};
use super::signature;
use super::{Callback, Provider, WebhookOutcome, WebhookRequest, WebhookResponse};
use crate::config::{LedgerConfig, ProvidersConfig};
use crate::error::Result;
use crate::model::{Account, NewAudit, ProcessedTransaction};
use crate::normalize::{normalize, RewardSignal, DEFAULT_RAW_UNIT};
use crate::services::settings::{decimal_setting, BASE_DOLLAR};
use crate::storage::{LedgerStore, LedgerTx};
use crate::utils::retry::with_conflict_retry;

const INVALID_SIGNATURE: &str = "Invalid signature/hash";

/// Verifies, deduplicates and applies provider callbacks.
#[derive(Clone)]
pub struct WebhookEngine {
    store: Arc<dyn LedgerStore>,
    ledger: LedgerConfig,
    providers: ProvidersConfig,
}

impl WebhookEngine {
    pub fn new(store: Arc<dyn LedgerStore>, ledger: LedgerConfig, providers: ProvidersConfig) -> Self {
        Self {
            store,
            ledger,
            providers,
        }
    }

    /// Handle one delivery and return the acknowledgment to send.
    pub async fn handle(
        &self,
        callback: Callback,
        request: &WebhookRequest,
        now: DateTime<Utc>,
    ) -> Result<WebhookResponse> {
        let provider = callback.provider();
        let outcome = self.process(callback, request, now).await?;

        match &outcome {
            WebhookOutcome::Rejected { reason } | WebhookOutcome::Ignored { reason } => {
                warn!(provider = %provider, reason = %reason, "Webhook ignored");
            }
            WebhookOutcome::Duplicate { tx_id } => {
                info!(provider = %provider, tx_id = %tx_id, "Duplicate webhook ignored");
            }
            WebhookOutcome::UserNotFound { tx_id } => {
                warn!(provider = %provider, tx_id = %tx_id, "Webhook for unknown user recorded");
            }
            other => info!(provider = %provider, outcome = ?other, "Webhook applied"),
        }

        Ok(outcome.to_response(provider))
    }

    /// Verify, parse and apply; returns the outcome without HTTP shaping.
    pub async fn process(
        &self,
        callback: Callback,
        request: &WebhookRequest,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        if let Err(outcome) = self.verify(callback, request) {
            return Ok(outcome);
        }

        let signed;
        let request = if callback.provider() == Provider::BitLabs {
            match request.bitlabs_signed() {
                Some(view) => {
                    signed = view;
                    &signed
                }
                None => {
                    return Ok(WebhookOutcome::Rejected {
                        reason: INVALID_SIGNATURE.to_string(),
                    })
                }
            }
        } else {
            request
        };

        let parsed = match payload::parse(callback, request) {
            Ok(parsed) => parsed,
            Err(reason) => return Ok(WebhookOutcome::Ignored { reason }),
        };

        with_conflict_retry("webhook", || self.apply_once(callback, request, &parsed, now)).await
    }

    fn verify(&self, callback: Callback, request: &WebhookRequest) -> std::result::Result<(), WebhookOutcome> {
        let provider = callback.provider();
        let secret = &self.providers.for_provider(provider).secret;

        let verified = match provider {
            Provider::BitLabs => {
                if request.param(&["hash"]).is_none() {
                    return Err(WebhookOutcome::Ignored {
                        reason: "Missing signature/hash".to_string(),
                    });
                }
                let Some(raw_url) = request.raw_url.as_deref() else {
                    return Err(WebhookOutcome::Ignored {
                        reason: "Hash parameter not found in URL".to_string(),
                    });
                };
                if signature::bitlabs_payload(raw_url).is_none() {
                    return Err(WebhookOutcome::Ignored {
                        reason: "Hash parameter not found in URL".to_string(),
                    });
                }
                // The hash must be the last parameter; the decoded map would
                // otherwise let unsigned trailing values override signed ones.
                signature::bitlabs_hash(raw_url)
                    .is_some_and(|received| signature::verify_bitlabs(raw_url, received, secret))
            }
            Provider::CpxResearch => request
                .param(&["hash"])
                .is_some_and(|received| signature::verify_cpx(&request.params, received, secret)),
            Provider::AdGem => request
                .param(&["verifier"])
                .is_some_and(|received| signature::verify_adgem(&request.params, received, secret)),
        };

        if verified {
            Ok(())
        } else {
            Err(WebhookOutcome::Rejected {
                reason: INVALID_SIGNATURE.to_string(),
            })
        }
    }

    async fn apply_once(
        &self,
        callback: Callback,
        request: &WebhookRequest,
        parsed: &ParsedCallback,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        let provider = callback.provider();
        let mut tx = self.store.begin().await?;

        let first_delivery = tx
            .mark_processed(&ProcessedTransaction {
                tx_id: parsed.tx_id.clone(),
                provider: provider.as_str().to_string(),
                processed_at: now,
            })
            .await?;
        if !first_delivery {
            return Ok(WebhookOutcome::Duplicate {
                tx_id: parsed.tx_id.clone(),
            });
        }

        let Some(account) = find_account(tx.as_mut(), &parsed.user).await? else {
            tx.commit().await?;
            return Ok(WebhookOutcome::UserNotFound {
                tx_id: parsed.tx_id.clone(),
            });
        };

        let source_ip = parsed
            .client_ip
            .as_deref()
            .or(request.source_ip.as_deref());
        let (completed, reversed) = callback.audit_categories();

        let outcome = match &parsed.action {
            CallbackAction::Complete {
                signal,
                external_ref,
            } => {
                let amount = self.normalize(tx.as_mut(), provider, signal).await?;
                let effect = record_completion(
                    tx.as_mut(),
                    account.id,
                    callback.source(),
                    external_ref.as_deref(),
                    amount,
                    now,
                )
                .await?;
                if amount > Decimal::ZERO {
                    tx.append_audit(
                        &NewAudit::new(
                            completed,
                            Some(account.id),
                            format!(
                                "{provider} transaction {} completed: {amount} points added to pending balance ({} netted against chargebacks).",
                                parsed.tx_id, effect.netted
                            ),
                            now,
                        )
                        .with_source_ip(source_ip),
                    )
                    .await?;
                }
                WebhookOutcome::Credited {
                    tx_id: parsed.tx_id.clone(),
                    account_id: account.id,
                    amount,
                    netted: effect.netted,
                }
            }
            CallbackAction::Reverse {
                signal,
                external_ref,
            } => {
                let amount = self.normalize(tx.as_mut(), provider, signal).await?;
                let effect = record_reversal(
                    tx.as_mut(),
                    account.id,
                    callback.source(),
                    external_ref.as_deref(),
                    amount,
                    now,
                )
                .await?;
                tx.append_audit(
                    &NewAudit::new(
                        reversed,
                        Some(account.id),
                        format!(
                            "{provider} transaction {} reversed offer {}: {} points deducted from pending balance ({}).",
                            parsed.tx_id,
                            external_ref.as_deref().unwrap_or("unknown"),
                            effect.deducted,
                            effect.status.map(|s| s.as_str()).unwrap_or("no matching entry"),
                        ),
                        now,
                    )
                    .with_source_ip(source_ip),
                )
                .await?;
                WebhookOutcome::Reversed {
                    tx_id: parsed.tx_id.clone(),
                    account_id: account.id,
                    deducted: effect.deducted,
                    matched: effect.matched,
                }
            }
            CallbackAction::Chargebacks { source, items } => {
                let mut total = Decimal::ZERO;
                for item in items {
                    let effect = record_reversal(
                        tx.as_mut(),
                        account.id,
                        source,
                        item.earning_id.as_deref(),
                        item.amount,
                        now,
                    )
                    .await?;
                    total += effect.deducted;
                    tx.append_audit(
                        &NewAudit::new(
                            reversed,
                            Some(account.id),
                            format!(
                                "Chargeback of {} points for {source} {}. Reason: {}",
                                item.amount,
                                item.earning_id.as_deref().unwrap_or("unknown"),
                                item.reason
                            ),
                            now,
                        )
                        .with_source_ip(source_ip),
                    )
                    .await?;
                }
                WebhookOutcome::Reconciled {
                    tx_id: parsed.tx_id.clone(),
                    account_id: account.id,
                    processed: items.len(),
                    total_deducted: total,
                }
            }
            CallbackAction::Unknown { status } => WebhookOutcome::Ignored {
                reason: format!("Unknown status received: {status}"),
            },
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn normalize(
        &self,
        tx: &mut dyn LedgerTx,
        provider: Provider,
        signal: &RewardSignal,
    ) -> Result<Decimal> {
        let base_rate = decimal_setting(tx, BASE_DOLLAR, self.ledger.base_dollar_rate).await?;
        let raw_unit = self
            .providers
            .for_provider(provider)
            .raw_unit
            .unwrap_or(DEFAULT_RAW_UNIT);
        Ok(normalize(signal, raw_unit, base_rate))
    }

    /// Handle an AdGem player ban notification.
    ///
    /// The body is signed as a whole with the ban secret, delivered in the
    /// `Signature` header.
    pub async fn handle_ban(
        &self,
        body: &str,
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookResponse> {
        let outcome = self.process_ban(body, signature_header, now).await?;
        match &outcome {
            WebhookOutcome::BanUpdated { account_id, banned } => {
                info!(account_id, banned, "AdGem ban status updated");
            }
            other => warn!(outcome = ?other, "AdGem ban notification not applied"),
        }
        Ok(outcome.to_response(Provider::AdGem))
    }

    pub async fn process_ban(
        &self,
        body: &str,
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        let verified = signature_header.is_some_and(|received| {
            signature::verify_adgem_ban(body.as_bytes(), received, &self.providers.adgem_ban_secret)
        });
        if !verified {
            return Ok(WebhookOutcome::Rejected {
                reason: INVALID_SIGNATURE.to_string(),
            });
        }

        let Ok(payload) = serde_json::from_str::<Value>(body) else {
            return Ok(WebhookOutcome::Ignored {
                reason: "Invalid JSON body".to_string(),
            });
        };
        let banned = match payload.get("type").and_then(Value::as_str) {
            Some("player.banned") => true,
            Some("player.unbanned") => false,
            other => {
                return Ok(WebhookOutcome::Ignored {
                    reason: format!("Unsupported event type: {}", other.unwrap_or("none")),
                })
            }
        };
        let player = payload
            .get("data")
            .and_then(|d| d.get("player_id"))
            .and_then(|p| match p {
                Value::String(s) => s.trim().parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .filter(|id| *id > 0);
        let Some(player) = player else {
            return Ok(WebhookOutcome::Ignored {
                reason: "Missing player_id".to_string(),
            });
        };

        with_conflict_retry("adgem_ban", || self.apply_ban_once(player, banned, now)).await
    }

    async fn apply_ban_once(&self, player: i64, banned: bool, now: DateTime<Utc>) -> Result<WebhookOutcome> {
        let mut tx = self.store.begin().await?;
        let Some(mut account) = tx.account(player).await? else {
            return Ok(WebhookOutcome::UserNotFound {
                tx_id: player.to_string(),
            });
        };

        if account.is_banned != banned {
            account.is_banned = banned;
            tx.update_account(&account).await?;
            tx.append_audit(&NewAudit::new(
                if banned {
                    "ADGEM_PLAYER_BANNED"
                } else {
                    "ADGEM_PLAYER_UNBANNED"
                },
                Some(account.id),
                format!(
                    "AdGem marked player {} as {}.",
                    account.id,
                    if banned { "banned" } else { "unbanned" }
                ),
                now,
            ))
            .await?;
            tx.commit().await?;
        }

        Ok(WebhookOutcome::BanUpdated {
            account_id: account.id,
            banned,
        })
    }
}

async fn find_account(tx: &mut dyn LedgerTx, user: &UserRef) -> Result<Option<Account>> {
    Ok(match user {
        UserRef::Id(id) => tx.account(*id).await?,
        UserRef::Email(email) => tx.account_by_email(email).await?,
    })
}
