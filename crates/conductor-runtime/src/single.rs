//! Single-task orchestrator: five checkpointed steps for one subtask.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::prompt::{truncate_chars, PromptBuilder};
use crate::services::RunServices;
use crate::steps::StepContext;
use crate::types::{AttachmentOutcome, FunctionKind, SubtaskRequest, SubtaskRunResult};
use conductor_billing::{MeterOutcome, AUTO_RELOAD_EVENT};
use conductor_core::{Error, Result};
use conductor_llm::ModelResponse;
use conductor_store::{AiExecutionStatus, Issue, NewJob, Workspace};

const EMPTY_OUTPUT_SUMMARY: &str = "AI execution produced no output";

/// Output of `load-context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadedSubtask {
    workspace: Workspace,
    parent: Issue,
    subtask: Issue,
}

pub struct SingleTaskOrchestrator {
    services: Arc<RunServices>,
}

impl SingleTaskOrchestrator {
    pub fn new(services: Arc<RunServices>) -> Self {
        Self { services }
    }

    /// Precondition check, run before the trigger is accepted.
    pub fn check(&self, subtask_id: &str) -> Result<()> {
        self.services.resolve_subtask(subtask_id).map(|_| ())
    }

    /// Body of one attempt.
    pub async fn run(&self, ctx: &StepContext, request: &SubtaskRequest) -> Result<SubtaskRunResult> {
        let services = &self.services;
        let run_id = ctx.run_id();

        let loaded: LoadedSubtask = ctx
            .run("load-context", || async {
                let resolved = services.resolve_subtask(&request.subtask_id)?;
                services.jobs.create(&NewJob {
                    workspace_id: resolved.workspace.id.clone(),
                    function_id: FunctionKind::SingleTask.function_id().to_string(),
                    run_id: run_id.to_string(),
                    metadata: Some(json!({
                        "subtaskId": resolved.subtask.id,
                        "parentId": resolved.parent.id,
                        "identifier": resolved.subtask.identifier,
                    })),
                    max_attempts: services.limits.max_attempts,
                })?;
                services
                    .store
                    .set_ai_execution_status(&resolved.subtask.id, AiExecutionStatus::Running)?;
                Ok(LoadedSubtask {
                    workspace: resolved.workspace,
                    parent: resolved.parent,
                    subtask: resolved.subtask,
                })
            })
            .await?;
        services.jobs.mark_running(run_id, ctx.attempt())?;

        let response: ModelResponse = ctx
            .run("execute", || async {
                let prompt = PromptBuilder::build(
                    &loaded.workspace,
                    Some(&loaded.parent),
                    &loaded.subtask,
                    &[],
                );
                services.engine.execute(&prompt).await
            })
            .await?;

        let metering: MeterOutcome = ctx
            .run("track-usage", || async {
                services.meter(
                    &loaded.workspace,
                    &loaded.subtask,
                    &response,
                    format!("{}:track-usage", run_id),
                )
            })
            .await?;
        if let Some(reload) = &metering.reload_requested {
            ctx.send("request-reload", AUTO_RELOAD_EVENT, &serde_json::to_value(reload)?)?;
        }

        let attachment: AttachmentOutcome = ctx
            .run("save-attachment", || async {
                Ok(services
                    .save_attachment(&loaded.workspace, &loaded.parent, &loaded.subtask, &response.text)
                    .await)
            })
            .await?;

        ctx.run("finalize", || async {
            let text = response.text.trim();
            let (status, summary) = if text.is_empty() {
                (AiExecutionStatus::Failed, EMPTY_OUTPUT_SUMMARY.to_string())
            } else {
                (
                    AiExecutionStatus::Completed,
                    truncate_chars(text, services.limits.summary_chars),
                )
            };

            let result = SubtaskRunResult {
                run_id: run_id.to_string(),
                subtask_id: loaded.subtask.id.clone(),
                identifier: loaded.subtask.identifier.clone(),
                status,
                summary: summary.clone(),
                attachment: attachment.clone(),
                metering: metering.clone(),
            };
            let blob = json!({
                "runId": run_id,
                "text": response.text,
                "model": response.model,
                "usage": response.usage,
                "attachmentKey": attachment.key(),
            });
            services
                .store
                .record_ai_execution(&loaded.subtask.id, status, Some(&blob), Some(&summary))?;

            let job_result = serde_json::to_value(&result)?;
            if status == AiExecutionStatus::Completed {
                services.jobs.complete(run_id, &job_result)?;
            } else {
                services.jobs.fail(run_id, &summary, Some(&job_result))?;
            }
            info!(
                "Subtask {} finished as {} (run {})",
                loaded.subtask.identifier, status, run_id
            );
            Ok(result)
        })
        .await
    }

    /// Failure hook: runs once the runtime gives up on a run. Marks the
    /// subtask and the job failed with the error text.
    pub fn on_failure(&self, request: &SubtaskRequest, err: &Error) {
        let message = err.to_string();
        let services = &self.services;

        // A rejected precondition means the run never touched the subtask.
        if !matches!(err, Error::Precondition(_)) {
            let marked = services.store.get_issue(&request.subtask_id).and_then(|issue| {
                match issue {
                    Some(issue) if !is_settled(&issue) => services.store.record_ai_execution(
                        &issue.id,
                        AiExecutionStatus::Failed,
                        Some(&json!({ "runId": request.run_id, "error": message })),
                        Some(&format!("AI execution failed: {}", message)),
                    ),
                    _ => Ok(false),
                }
            });
            if let Err(e) = marked {
                error!("Failure hook could not mark subtask {}: {}", request.subtask_id, e);
            }
        }

        if let Err(e) = services.jobs.fail(&request.run_id, &message, None) {
            error!("Failure hook could not fail job for run {}: {}", request.run_id, e);
        }
    }
}

fn is_settled(issue: &Issue) -> bool {
    issue
        .ai_execution_status
        .map(|s| s.is_terminal())
        .unwrap_or(false)
}
