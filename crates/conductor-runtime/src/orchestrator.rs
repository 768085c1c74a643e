//! Orchestrator: admits runs, bounds concurrency per function kind and
//! drives the single-task and sequential bodies through the step runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::attachments::AttachmentStore;
use crate::sequential::SequentialOrchestrator;
use crate::services::{RunLimits, RunServices};
use crate::single::SingleTaskOrchestrator;
use crate::steps::StepRuntime;
use crate::types::*;
use conductor_core::{ConcurrencyLimits, ConductorConfig, Error, Result};
use conductor_llm::{ExecutionEngine, ModelClient};
use conductor_store::SqliteStore;

pub struct Orchestrator {
    services: Arc<RunServices>,
    runtime: StepRuntime,
    single: SingleTaskOrchestrator,
    sequential: SequentialOrchestrator,
    single_slots: Arc<Semaphore>,
    sequential_slots: Arc<Semaphore>,
    paused: AtomicBool,
}

impl Orchestrator {
    pub fn new(services: Arc<RunServices>, runtime: StepRuntime, limits: ConcurrencyLimits) -> Self {
        info!(
            "Orchestrator initialized: single_task={}, sequential={}, max_attempts={}",
            limits.single_task,
            limits.sequential,
            runtime.max_attempts()
        );
        Self {
            single: SingleTaskOrchestrator::new(services.clone()),
            sequential: SequentialOrchestrator::new(services.clone()),
            services,
            runtime,
            single_slots: Arc::new(Semaphore::new(limits.single_task.max(1))),
            sequential_slots: Arc::new(Semaphore::new(limits.sequential.max(1))),
            paused: AtomicBool::new(false),
        }
    }

    /// Wire every collaborator from configuration.
    pub fn from_config(
        config: &ConductorConfig,
        store: Arc<SqliteStore>,
        client: Arc<dyn ModelClient>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        let engine = ExecutionEngine::new(client, config.model.clone());
        let services = Arc::new(RunServices::new(
            store.clone(),
            engine,
            attachments,
            RunLimits::from_config(config),
        ));
        let runtime = StepRuntime::new(store, config.max_attempts);
        Self::new(services, runtime, config.concurrency)
    }

    pub fn services(&self) -> &Arc<RunServices> {
        &self.services
    }

    /// Stop admitting new runs. In-flight runs continue to completion.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Orchestrator paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Orchestrator resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            paused: self.is_paused(),
            single_task_slots_free: self.single_slots.available_permits(),
            sequential_slots_free: self.sequential_slots.available_permits(),
        }
    }

    fn admit(&self) -> Result<()> {
        if self.is_paused() {
            return Err(Error::Paused);
        }
        Ok(())
    }

    /// A supplied run id that already has a job must name the same work;
    /// otherwise the new trigger would replay the other run's steps.
    fn check_run_id<F>(&self, run_id: &str, kind: FunctionKind, same_work: F) -> Result<()>
    where
        F: FnOnce(&serde_json::Value) -> bool,
    {
        let job = match self.services.store.get_job_by_run_id(run_id)? {
            Some(job) => job,
            None => return Ok(()),
        };
        let metadata = job.metadata.unwrap_or(serde_json::Value::Null);
        if job.function_id != kind.function_id() || !same_work(&metadata) {
            return Err(Error::Precondition(format!(
                "run id {} is already used by a different {} run",
                run_id, job.function_id
            )));
        }
        Ok(())
    }

    /// Validate a single-task trigger. Nothing is written when this fails.
    pub fn prepare_subtask(&self, subtask_id: &str, run_id: Option<String>) -> Result<SubtaskRequest> {
        self.admit()?;
        self.single.check(subtask_id)?;
        if let Some(id) = &run_id {
            self.check_run_id(id, FunctionKind::SingleTask, |meta| {
                meta["subtaskId"] == subtask_id
            })?;
        }
        Ok(SubtaskRequest {
            subtask_id: subtask_id.to_string(),
            run_id: run_id.unwrap_or_else(new_run_id),
        })
    }

    /// Validate a chain trigger, resolving the default order when
    /// `subtask_ids` is `None`. Nothing is written when this fails.
    pub fn prepare_sequential(
        &self,
        parent_id: &str,
        subtask_ids: Option<Vec<String>>,
        run_id: Option<String>,
    ) -> Result<SequentialRequest> {
        self.admit()?;
        let subtask_ids = self.sequential.check(parent_id, subtask_ids)?;
        if let Some(id) = &run_id {
            self.check_run_id(id, FunctionKind::Sequential, |meta| {
                meta["parentId"] == parent_id && meta["subtaskIds"] == serde_json::json!(subtask_ids)
            })?;
        }
        Ok(SequentialRequest {
            parent_id: parent_id.to_string(),
            subtask_ids,
            run_id: run_id.unwrap_or_else(new_run_id),
        })
    }

    /// Run one subtask to its terminal state, waiting for a slot first.
    pub async fn execute_subtask(&self, request: &SubtaskRequest) -> Result<SubtaskRunResult> {
        let _permit = self
            .single_slots
            .acquire()
            .await
            .map_err(|_| Error::Internal("single-task slots closed".into()))?;

        let single = &self.single;
        let result = self
            .runtime
            .invoke(FunctionKind::SingleTask.function_id(), &request.run_id, move |ctx| {
                async move { single.run(&ctx, request).await }
            })
            .await;
        if let Err(e) = &result {
            self.single.on_failure(request, e);
        }
        result
    }

    /// Run a chain to its terminal state, waiting for a slot first.
    pub async fn execute_sequential(&self, request: &SequentialRequest) -> Result<ChainSummary> {
        let _permit = self
            .sequential_slots
            .acquire()
            .await
            .map_err(|_| Error::Internal("sequential slots closed".into()))?;

        let sequential = &self.sequential;
        let result = self
            .runtime
            .invoke(FunctionKind::Sequential.function_id(), &request.run_id, move |ctx| {
                async move { sequential.run(&ctx, request).await }
            })
            .await;
        if let Err(e) = &result {
            self.sequential.on_failure(request, e);
        }
        result
    }

    /// Run in the background. Errors are already recorded on the job row.
    pub fn spawn_subtask(self: &Arc<Self>, request: SubtaskRequest) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.execute_subtask(&request).await {
                error!("Subtask run {} failed: {}", request.run_id, e);
            }
        })
    }

    pub fn spawn_sequential(self: &Arc<Self>, request: SequentialRequest) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.execute_sequential(&request).await {
                error!("Chain run {} failed: {}", request.run_id, e);
            }
        })
    }
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
