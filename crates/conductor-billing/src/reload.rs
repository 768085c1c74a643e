//! Auto-reload eligibility and the billing collaborator that fulfils reloads.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use conductor_core::{Error, Result};
use conductor_store::{SqliteStore, Subscription};

/// Outbox event consumed by the billing collaborator.
pub const AUTO_RELOAD_EVENT: &str = "billing/auto-reload.requested";

/// Payload of `AUTO_RELOAD_EVENT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadRequest {
    pub owner_id: String,
    pub amount: i64,
    pub threshold: i64,
    pub balance: i64,
    pub already_reloaded_this_month: i64,
    pub monthly_cap: i64,
    pub month: String,
    pub payment_method_id: String,
}

/// Decide whether a subscription, as it stands after a deduction, should
/// be topped up. Eligible iff reload is enabled, threshold and amount are
/// configured, the balance is under the threshold, a payment method exists
/// and the month's reloads plus this amount stay within the cap.
/// A subscription without a monthly cap is never reloaded automatically.
pub fn evaluate_auto_reload(sub: &Subscription, month: &str) -> Option<ReloadRequest> {
    if !sub.auto_reload_enabled {
        return None;
    }
    let (threshold, amount) = match (sub.auto_reload_threshold, sub.auto_reload_amount) {
        (Some(t), Some(a)) if a > 0 => (t, a),
        _ => return None,
    };
    if sub.tokens_remaining >= threshold {
        return None;
    }
    if !sub.has_payment_method() {
        return None;
    }
    let payment_method_id = sub.payment_method_id.clone()?;
    let cap = sub.max_monthly_auto_reload?;
    let already = sub.reloaded_in_month(month);
    if already + amount > cap {
        return None;
    }

    Some(ReloadRequest {
        owner_id: sub.owner_id.clone(),
        amount,
        threshold,
        balance: sub.tokens_remaining,
        already_reloaded_this_month: already,
        monthly_cap: cap,
        month: month.to_string(),
        payment_method_id,
    })
}

/// External payment provider. Charges the owner's stored payment method
/// for `tokens` and returns a provider reference.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, owner_id: &str, payment_method_id: &str, tokens: i64) -> Result<String>;
}

/// Gateway used when no payment provider is configured. Declines every charge.
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn charge(&self, owner_id: &str, _payment_method_id: &str, tokens: i64) -> Result<String> {
        Err(Error::Billing(format!(
            "No payment provider configured; cannot reload {} tokens for {}",
            tokens, owner_id
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ReloadOutcome {
    /// Charged and credited.
    Credited { charge_ref: String, tokens_remaining: i64 },
    /// Conditions no longer hold (already topped up, settings changed, cap reached).
    Skipped { reason: String },
}

/// Billing collaborator: consumes reload requests asynchronously, re-checks
/// them against current state, charges, then credits the balance.
pub struct AutoReloadProcessor {
    store: Arc<SqliteStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl AutoReloadProcessor {
    pub fn new(store: Arc<SqliteStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn process(&self, request: &ReloadRequest) -> Result<ReloadOutcome> {
        let current = self
            .store
            .get_subscription(&request.owner_id)?
            .ok_or_else(|| Error::NotFound(format!("subscription for {}", request.owner_id)))?;

        // Several runs may queue a request before the first is processed.
        let fresh = match evaluate_auto_reload(&current, &request.month) {
            Some(r) => r,
            None => {
                info!(
                    "Auto-reload for {} skipped: no longer eligible (balance={})",
                    request.owner_id, current.tokens_remaining
                );
                return Ok(ReloadOutcome::Skipped {
                    reason: "no longer eligible".into(),
                });
            }
        };

        let charge_ref = self
            .gateway
            .charge(&fresh.owner_id, &fresh.payment_method_id, fresh.amount)
            .await?;

        match self
            .store
            .credit_auto_reload(&fresh.owner_id, fresh.amount, &fresh.month)?
        {
            Some(updated) => {
                info!(
                    "Auto-reloaded {} tokens for {} (charge {}), balance now {}",
                    fresh.amount, fresh.owner_id, charge_ref, updated.tokens_remaining
                );
                Ok(ReloadOutcome::Credited {
                    charge_ref,
                    tokens_remaining: updated.tokens_remaining,
                })
            }
            None => {
                warn!(
                    "Charge {} succeeded but monthly cap blocked the credit for {}",
                    charge_ref, fresh.owner_id
                );
                Err(Error::Billing(format!(
                    "charge {} not credited: monthly cap reached",
                    charge_ref
                )))
            }
        }
    }
}
