//! Usage meter: price, append to the ledger, decrement, decide on a reload.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::pricing::cost_cents;
use crate::reload::{evaluate_auto_reload, ReloadRequest};
use conductor_core::Result;
use conductor_llm::TokenUsage;
use conductor_store::{SqliteStore, UsageEntry};

/// One metering request.
#[derive(Debug, Clone)]
pub struct TrackUsage {
    pub workspace_id: String,
    pub owner_id: String,
    pub model: String,
    pub usage: TokenUsage,
    /// Where the usage came from, e.g. `subtask:<id>`.
    pub source: String,
    /// Stable key for this metering call; a repeat with the same key is a no-op.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterOutcome {
    pub cost_cents: i64,
    pub total_tokens: i64,
    /// False when this key had already been metered.
    pub recorded: bool,
    /// Balance after the deduction, if the owner has a subscription.
    pub tokens_remaining: Option<i64>,
    /// Reload the caller must hand to the billing collaborator
    /// (`AUTO_RELOAD_EVENT`). Only set by the call that recorded the usage.
    pub reload_requested: Option<ReloadRequest>,
}

pub struct UsageMeter {
    store: Arc<SqliteStore>,
}

impl UsageMeter {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    pub fn track(&self, request: &TrackUsage) -> Result<MeterOutcome> {
        self.track_in_month(request, &crate::current_month())
    }

    /// Meter against an explicit reload month.
    pub fn track_in_month(&self, request: &TrackUsage, month: &str) -> Result<MeterOutcome> {
        let usage = request.usage;
        let cost = cost_cents(&request.model, usage.input_tokens, usage.output_tokens);
        let total_tokens = usage.billable_tokens() as i64;

        let entry = UsageEntry {
            workspace_id: request.workspace_id.clone(),
            model: request.model.clone(),
            input_tokens: usage.input_tokens as i64,
            output_tokens: usage.output_tokens as i64,
            cache_creation_input_tokens: usage.cache_creation_input_tokens as i64,
            cache_read_input_tokens: usage.cache_read_input_tokens as i64,
            total_tokens,
            cost_cents: cost,
            source: request.source.clone(),
        };

        let recording = self
            .store
            .record_usage(&entry, &request.owner_id, &request.idempotency_key)?;

        if recording.inserted {
            debug!(
                workspace = %request.workspace_id,
                model = %request.model,
                total_tokens,
                cost_cents = cost,
                balance_before = ?recording.balance_before,
                "Usage recorded"
            );
        }

        // Evaluated after the decrement. A repeated key changed nothing and
        // requests nothing.
        let reload = if recording.inserted {
            recording
                .subscription
                .as_ref()
                .and_then(|sub| evaluate_auto_reload(sub, month))
        } else {
            None
        };
        if let Some(req) = &reload {
            info!(
                "Auto-reload requested for {}: balance {} under threshold {}",
                req.owner_id, req.balance, req.threshold
            );
        }

        Ok(MeterOutcome {
            cost_cents: cost,
            total_tokens,
            recorded: recording.inserted,
            tokens_remaining: recording.subscription.map(|s| s.tokens_remaining),
            reload_requested: reload,
        })
    }
}
