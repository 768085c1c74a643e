//! Background outbox worker. Delivers follow-on events queued by runs and
//! by the usage meter to their in-process consumers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::state::AppState;
use conductor_billing::{ReloadOutcome, ReloadRequest, AUTO_RELOAD_EVENT};
use conductor_core::{Error, Result};
use conductor_runtime::{RunFinished, RUN_FINISHED_EVENT};
use conductor_store::{OutboxEvent, OutboxStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const BATCH_SIZE: usize = 50;

/// Start the background outbox worker task.
pub fn start_event_worker(state: Arc<AppState>) {
    tokio::spawn(async move {
        info!("Background event worker started");
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let delivered = drain_events(&state).await;
            if delivered > 0 {
                debug!("Delivered {} outbox events", delivered);
            }
        }
    });
}

/// Process one batch of pending events. Returns how many were delivered.
pub async fn drain_events(state: &AppState) -> usize {
    let events = match state.store.pending_events(BATCH_SIZE) {
        Ok(e) => e,
        Err(e) => {
            error!("Failed to read outbox: {}", e);
            return 0;
        }
    };

    let mut delivered = 0;
    for event in events {
        match dispatch(state, &event).await {
            Ok(()) => match state.store.mark_event_delivered(event.id) {
                Ok(()) => delivered += 1,
                Err(e) => error!("Failed to mark event {} delivered: {}", event.id, e),
            },
            Err(e) => match state.store.mark_event_failed(event.id, &e.to_string()) {
                Ok(OutboxStatus::Dead) => {
                    error!("Event {} ({}) gave up: {}", event.id, event.name, e)
                }
                Ok(_) => warn!("Event {} ({}) failed, will retry: {}", event.id, event.name, e),
                Err(store_err) => {
                    error!("Failed to record failure of event {}: {}", event.id, store_err)
                }
            },
        }
    }
    delivered
}

async fn dispatch(state: &AppState, event: &OutboxEvent) -> Result<()> {
    match event.name.as_str() {
        AUTO_RELOAD_EVENT => {
            let request: ReloadRequest = serde_json::from_value(event.payload.clone())?;
            match state.reloads.process(&request).await? {
                ReloadOutcome::Credited { tokens_remaining, .. } => info!(
                    "Auto-reloaded {} tokens for {} (balance {})",
                    request.amount, request.owner_id, tokens_remaining
                ),
                ReloadOutcome::Skipped { reason } => {
                    debug!("Auto-reload for {} skipped: {}", request.owner_id, reason)
                }
            }
            Ok(())
        }
        RUN_FINISHED_EVENT => {
            let finished: RunFinished = serde_json::from_value(event.payload.clone())?;
            if state.jobs.observe(&finished)? {
                debug!("Job for run {} settled from lifecycle event", finished.run_id);
            }
            Ok(())
        }
        other => Err(Error::Internal(format!("no handler for event {}", other))),
    }
}
