//! Collaborators shared by both orchestrators, plus precondition checks.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::attachments::{publish_result, AttachmentStore};
use crate::jobs::JobTracker;
use crate::types::AttachmentOutcome;
use conductor_billing::{MeterOutcome, TrackUsage, UsageMeter};
use conductor_core::{ConductorConfig, Error, Result};
use conductor_llm::{ExecutionEngine, ModelResponse};
use conductor_store::{Issue, SqliteStore, Workspace};

/// Per-run limits taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub max_attempts: u32,
    /// Character budget of one digest in the chain accumulator.
    pub digest_chars: usize,
    /// Character budget of the summary stored on a subtask.
    pub summary_chars: usize,
}

impl RunLimits {
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            digest_chars: config.digest_chars,
            summary_chars: config.summary_chars,
        }
    }
}

pub struct RunServices {
    pub store: Arc<SqliteStore>,
    pub engine: ExecutionEngine,
    pub meter: UsageMeter,
    pub attachments: Arc<dyn AttachmentStore>,
    pub jobs: JobTracker,
    pub limits: RunLimits,
}

/// A subtask with the rows its prompt needs.
pub struct SubtaskContext {
    pub workspace: Workspace,
    pub parent: Issue,
    pub subtask: Issue,
}

/// A parent with its validated chain, in execution order.
pub struct ChainContext {
    pub workspace: Workspace,
    pub parent: Issue,
    pub subtasks: Vec<Issue>,
}

impl RunServices {
    pub fn new(
        store: Arc<SqliteStore>,
        engine: ExecutionEngine,
        attachments: Arc<dyn AttachmentStore>,
        limits: RunLimits,
    ) -> Self {
        Self {
            meter: UsageMeter::new(store.clone()),
            jobs: JobTracker::new(store.clone()),
            store,
            engine,
            attachments,
            limits,
        }
    }

    fn workspace(&self, id: &str) -> Result<Workspace> {
        self.store
            .get_workspace(id)?
            .ok_or_else(|| Error::Precondition(format!("workspace {} not found", id)))
    }

    /// Load a subtask for execution. Fails if the subtask or its parent is
    /// missing, or the subtask is not AI-assignable.
    pub fn resolve_subtask(&self, subtask_id: &str) -> Result<SubtaskContext> {
        let subtask = self
            .store
            .get_issue(subtask_id)?
            .ok_or_else(|| Error::Precondition(format!("subtask {} not found", subtask_id)))?;
        if !subtask.ai_assignable {
            return Err(Error::Precondition(format!(
                "subtask {} is not AI-assignable",
                subtask.identifier
            )));
        }
        let parent_id = subtask.parent_id.as_deref().ok_or_else(|| {
            Error::Precondition(format!("subtask {} has no parent issue", subtask.identifier))
        })?;
        let parent = self
            .store
            .get_issue(parent_id)?
            .ok_or_else(|| Error::Precondition(format!("parent issue {} not found", parent_id)))?;
        let workspace = self.workspace(&subtask.workspace_id)?;
        Ok(SubtaskContext {
            workspace,
            parent,
            subtask,
        })
    }

    /// Chain order when the caller gives none: the parent's AI-assignable
    /// subtasks by position.
    pub fn default_chain(&self, parent_id: &str) -> Result<Vec<String>> {
        if self.store.get_issue(parent_id)?.is_none() {
            return Err(Error::Precondition(format!(
                "parent issue {} not found",
                parent_id
            )));
        }
        let ids: Vec<String> = self
            .store
            .get_subtasks(parent_id)?
            .into_iter()
            .filter(|s| s.ai_assignable)
            .map(|s| s.id)
            .collect();
        if ids.is_empty() {
            return Err(Error::Precondition(format!(
                "parent issue {} has no AI-assignable subtasks",
                parent_id
            )));
        }
        Ok(ids)
    }

    /// Validate an explicit chain: non-empty, no repeats, every entry an
    /// AI-assignable subtask of `parent_id`.
    pub fn resolve_chain(&self, parent_id: &str, subtask_ids: &[String]) -> Result<ChainContext> {
        let parent = self
            .store
            .get_issue(parent_id)?
            .ok_or_else(|| Error::Precondition(format!("parent issue {} not found", parent_id)))?;
        if subtask_ids.is_empty() {
            return Err(Error::Precondition("subtask chain is empty".into()));
        }

        let mut seen = HashSet::new();
        let mut subtasks = Vec::with_capacity(subtask_ids.len());
        for id in subtask_ids {
            if !seen.insert(id.as_str()) {
                return Err(Error::Precondition(format!(
                    "subtask {} appears twice in the chain",
                    id
                )));
            }
            let subtask = self
                .store
                .get_issue(id)?
                .ok_or_else(|| Error::Precondition(format!("subtask {} not found", id)))?;
            if subtask.parent_id.as_deref() != Some(parent.id.as_str()) {
                return Err(Error::Precondition(format!(
                    "subtask {} does not belong to {}",
                    subtask.identifier, parent.identifier
                )));
            }
            if !subtask.ai_assignable {
                return Err(Error::Precondition(format!(
                    "subtask {} is not AI-assignable",
                    subtask.identifier
                )));
            }
            subtasks.push(subtask);
        }

        let workspace = self.workspace(&parent.workspace_id)?;
        Ok(ChainContext {
            workspace,
            parent,
            subtasks,
        })
    }

    /// Meter one model response under `idempotency_key`.
    pub fn meter(
        &self,
        workspace: &Workspace,
        subtask: &Issue,
        response: &ModelResponse,
        idempotency_key: String,
    ) -> Result<MeterOutcome> {
        self.meter.track(&TrackUsage {
            workspace_id: workspace.id.clone(),
            owner_id: workspace.owner_id.clone(),
            model: response.model.clone(),
            usage: response.usage,
            source: format!("subtask:{}", subtask.id),
            idempotency_key,
        })
    }

    /// Attach output text to the parent issue. Store failures are logged
    /// and reported in the outcome, never returned.
    pub async fn save_attachment(
        &self,
        workspace: &Workspace,
        parent: &Issue,
        subtask: &Issue,
        text: &str,
    ) -> AttachmentOutcome {
        if text.trim().is_empty() {
            return AttachmentOutcome::Skipped;
        }
        match publish_result(
            self.attachments.as_ref(),
            &self.store,
            &workspace.id,
            &parent.id,
            &subtask.identifier,
            text,
        )
        .await
        {
            Ok(record) => AttachmentOutcome::Saved {
                key: record.storage_key,
                filename: record.filename,
            },
            Err(e) => {
                warn!(
                    "Could not attach result of {} to {}: {}",
                    subtask.identifier, parent.identifier, e
                );
                AttachmentOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
