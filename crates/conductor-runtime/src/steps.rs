//! Durable step runtime.
//!
//! A run is a body function invoked with a `StepContext`. Every named step
//! persists its output on first success; when the body is invoked again
//! for the same run id (a retry or a redelivered trigger) completed steps
//! return their stored output instead of re-executing. Side effects that
//! must happen once per run therefore belong inside a step. Memos are
//! keyed by function id and run id together.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use conductor_core::{Error, Result};
use conductor_store::{JobStatus, SqliteStore};

/// Emitted through the outbox whenever an invocation settles.
pub const RUN_FINISHED_EVENT: &str = "run/finished";

/// Payload of `RUN_FINISHED_EVENT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFinished {
    pub function_id: String,
    pub run_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Handle passed to a run body for one attempt.
pub struct StepContext {
    store: Arc<SqliteStore>,
    function_id: String,
    run_id: String,
    attempt: u32,
}

impl StepContext {
    pub fn new(store: Arc<SqliteStore>, function_id: &str, run_id: &str, attempt: u32) -> Self {
        Self {
            store,
            function_id: function_id.to_string(),
            run_id: run_id.to_string(),
            attempt,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// 1-based attempt number of this invocation.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Run a named step at most once per run. A stored output is decoded
    /// and returned without calling `f`. Errors are not stored, so a failed
    /// step runs again on the next attempt.
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(stored) = self
            .store
            .get_step_result(&self.function_id, &self.run_id, name)?
        {
            debug!(run_id = %self.run_id, step = name, "Replaying memoized step");
            return Ok(serde_json::from_str(&stored)?);
        }

        let output = f().await?;
        let json = serde_json::to_string(&output)?;
        let stored = self
            .store
            .save_step_result(&self.function_id, &self.run_id, name, &json)?;
        if stored != json {
            // A concurrent attempt finished the same step first.
            debug!(run_id = %self.run_id, step = name, "Step already memoized, using stored output");
            return Ok(serde_json::from_str(&stored)?);
        }
        Ok(output)
    }

    /// Queue an event for out-of-band consumers under a send id unique
    /// within the run. A replayed body repeating the same send queues
    /// nothing new. Returns whether the event was queued by this call.
    pub fn send(&self, id: &str, event_name: &str, payload: &serde_json::Value) -> Result<bool> {
        let dedupe = format!("{}:{}:send:{}", self.function_id, self.run_id, id);
        let queued = self.store.enqueue_event(event_name, payload, Some(&dedupe))?;
        if queued {
            debug!(run_id = %self.run_id, event = event_name, send = id, "Event queued");
        }
        Ok(queued)
    }
}

/// Drives run bodies with bounded retries.
#[derive(Clone)]
pub struct StepRuntime {
    store: Arc<SqliteStore>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl StepRuntime {
    pub fn new(store: Arc<SqliteStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Base delay between attempts; attempt `n` waits `n * backoff`.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Invoke `body` until it succeeds, fails permanently, or runs out of
    /// attempts. Every attempt shares the run id, so steps completed by an
    /// earlier attempt replay. The settled outcome is published as
    /// `RUN_FINISHED_EVENT`; a body that returns normally after failing its
    /// own job is published as failed.
    pub async fn invoke<T, F, Fut>(&self, function_id: &str, run_id: &str, mut body: F) -> Result<T>
    where
        F: FnMut(StepContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let ctx = StepContext::new(self.store.clone(), function_id, run_id, attempt);
            match body(ctx).await {
                Ok(value) => {
                    let (status, error) = self.settled_status(function_id, run_id);
                    self.publish_finished(function_id, run_id, status, attempt, error);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "{} run {} attempt {}/{} failed, retrying: {}",
                        function_id, run_id, attempt, self.max_attempts, e
                    );
                    let delay = self.retry_backoff * attempt;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    info!(
                        "{} run {} failed after {} attempt(s): {}",
                        function_id, run_id, attempt, e
                    );
                    self.publish_finished(
                        function_id,
                        run_id,
                        JobStatus::Failed,
                        attempt,
                        Some(e.to_string()),
                    );
                    return Err(e);
                }
            }
        }
    }

    fn settled_status(&self, function_id: &str, run_id: &str) -> (JobStatus, Option<String>) {
        match self.store.get_job_by_run_id(run_id) {
            Ok(Some(job)) if job.function_id == function_id && job.status == JobStatus::Failed => {
                (JobStatus::Failed, job.error)
            }
            Ok(_) => (JobStatus::Completed, None),
            Err(e) => {
                warn!("Could not read job for run {}: {}", run_id, e);
                (JobStatus::Completed, None)
            }
        }
    }

    fn publish_finished(
        &self,
        function_id: &str,
        run_id: &str,
        status: JobStatus,
        attempts: u32,
        error: Option<String>,
    ) {
        let event = RunFinished {
            function_id: function_id.to_string(),
            run_id: run_id.to_string(),
            status,
            attempts,
            error,
        };
        let dedupe = format!("{}:{}", run_id, RUN_FINISHED_EVENT);
        let queued = serde_json::to_value(&event)
            .map_err(Error::from)
            .and_then(|payload| {
                self.store
                    .enqueue_event(RUN_FINISHED_EVENT, &payload, Some(&dedupe))
            });
        if let Err(e) = queued {
            warn!("Failed to publish {} for run {}: {}", RUN_FINISHED_EVENT, run_id, e);
        }
    }
}
