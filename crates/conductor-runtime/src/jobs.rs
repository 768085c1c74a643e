//! Job tracker: one user-visible row per run id.

use std::sync::Arc;

use tracing::{debug, info};

use crate::steps::RunFinished;
use conductor_core::{Error, Result};
use conductor_store::{JobRecord, JobStatus, NewJob, SqliteStore};

/// Function id of the lifecycle observer itself; its own runs are never tracked.
pub const JOB_TRACKER_FUNCTION_ID: &str = "job-tracker";

pub struct JobTracker {
    store: Arc<SqliteStore>,
}

impl JobTracker {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    pub fn tracks(&self, function_id: &str) -> bool {
        function_id != JOB_TRACKER_FUNCTION_ID
    }

    /// Create the pending row for `job.run_id`, or return the existing one.
    /// Redelivering a trigger never produces a second row.
    pub fn create(&self, job: &NewJob) -> Result<JobRecord> {
        let job_id = uuid::Uuid::new_v4().to_string();
        if self.store.insert_job_if_absent(job, &job_id)? {
            info!(
                "Job {} created for {} run {}",
                job_id, job.function_id, job.run_id
            );
        } else {
            debug!(run_id = %job.run_id, "Job already exists for run");
        }
        self.get(&job.run_id)?
            .ok_or_else(|| Error::Internal(format!("job row for run {} vanished", job.run_id)))
    }

    pub fn get(&self, run_id: &str) -> Result<Option<JobRecord>> {
        self.store.get_job_by_run_id(run_id)
    }

    pub fn mark_running(&self, run_id: &str, attempt: u32) -> Result<bool> {
        self.store.mark_job_running(run_id, attempt)
    }

    /// Terminal success. No-op (false) when the job already settled.
    pub fn complete(&self, run_id: &str, result: &serde_json::Value) -> Result<bool> {
        let changed = self
            .store
            .finish_job(run_id, JobStatus::Completed, Some(result), None)?;
        if changed {
            info!("Job for run {} completed", run_id);
        }
        Ok(changed)
    }

    /// Terminal failure. No-op (false) when the job already settled.
    pub fn fail(&self, run_id: &str, error: &str, result: Option<&serde_json::Value>) -> Result<bool> {
        let changed = self
            .store
            .finish_job(run_id, JobStatus::Failed, result, Some(error))?;
        if changed {
            info!("Job for run {} failed: {}", run_id, error);
        }
        Ok(changed)
    }

    /// Apply a run lifecycle event. Settles jobs whose orchestrator could not
    /// (e.g. the failure hook itself errored). Returns whether a row changed.
    pub fn observe(&self, event: &RunFinished) -> Result<bool> {
        if !self.tracks(&event.function_id) {
            return Ok(false);
        }
        match event.status {
            JobStatus::Completed => {
                self.store
                    .finish_job(&event.run_id, JobStatus::Completed, None, None)
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                let error = event.error.as_deref().unwrap_or("run failed");
                self.store
                    .finish_job(&event.run_id, event.status, None, Some(error))
            }
            JobStatus::Pending | JobStatus::Running => Ok(false),
        }
    }
}
