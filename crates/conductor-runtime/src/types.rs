//! Runtime types.

use serde::{Deserialize, Serialize};

use conductor_billing::MeterOutcome;
use conductor_store::AiExecutionStatus;

/// Orchestration function kinds. Each has its own concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FunctionKind {
    /// One subtask through the five-step pipeline.
    SingleTask,
    /// An ordered chain of subtasks under one parent.
    Sequential,
}

impl FunctionKind {
    pub fn function_id(&self) -> &'static str {
        match self {
            Self::SingleTask => "execute-ai-subtask",
            Self::Sequential => "execute-ai-subtasks-sequential",
        }
    }
}

/// Request to run one subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskRequest {
    pub subtask_id: String,
    /// Correlation key; a redelivery with the same run id replays the run.
    pub run_id: String,
}

/// Request to run a chain of subtasks under one parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequentialRequest {
    pub parent_id: String,
    /// Chain order. Resolved before the run starts; never empty.
    pub subtask_ids: Vec<String>,
    pub run_id: String,
}

/// Where the output text ended up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AttachmentOutcome {
    Saved { key: String, filename: String },
    /// Nothing to attach (empty output).
    Skipped,
    /// The store failed; the result is still recorded on the subtask.
    Failed { reason: String },
}

impl AttachmentOutcome {
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Saved { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Result of the single-task pipeline; also the job's result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskRunResult {
    pub run_id: String,
    pub subtask_id: String,
    pub identifier: String,
    pub status: AiExecutionStatus,
    pub summary: String,
    pub attachment: AttachmentOutcome,
    pub metering: MeterOutcome,
}

/// Outcome of one subtask inside a chain. Memoized per chain step, so it
/// must only hold values that are identical on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum TaskOutcome {
    #[serde(rename_all = "camelCase")]
    Succeeded {
        issue_id: String,
        identifier: String,
        title: String,
        /// Full output text; truncated when it enters the digest accumulator.
        output: String,
        summary: String,
    },
    #[serde(rename_all = "camelCase")]
    Failed { issue_id: String, reason: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Per-subtask line of a chain result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainItemSummary {
    pub subtask_id: String,
    pub status: AiExecutionStatus,
    pub summary: String,
}

/// Aggregate result of a chain; also the job's result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSummary {
    pub run_id: String,
    pub parent_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub results: Vec<ChainItemSummary>,
}

/// Admission and capacity snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub paused: bool,
    pub single_task_slots_free: usize,
    pub sequential_slots_free: usize,
}
