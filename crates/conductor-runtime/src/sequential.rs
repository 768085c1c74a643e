//! Sequential orchestrator: an ordered chain of subtasks under one job.
//!
//! Each subtask runs in its own checkpointed step and sees digests of the
//! subtasks completed before it. The digest list is never kept across
//! steps; it is folded from the memoized outcomes before each step, so a
//! resumed run rebuilds exactly what the interrupted one had.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::prompt::{truncate_chars, PreviousTaskResult, PromptBuilder};
use crate::services::RunServices;
use crate::steps::StepContext;
use crate::types::{ChainItemSummary, ChainSummary, FunctionKind, SequentialRequest, TaskOutcome};
use conductor_billing::{MeterOutcome, AUTO_RELOAD_EVENT};
use conductor_core::{Error, Result};
use conductor_llm::ModelResponse;
use conductor_store::{AiExecutionStatus, Issue, NewJob, Workspace};

/// Output of the chain's `load-context` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadedChain {
    workspace: Workspace,
    parent: Issue,
    subtasks: Vec<Issue>,
}

/// Step name of the chain entry at `index`.
pub fn chain_step_name(index: usize, subtask_id: &str) -> String {
    format!("subtask-{}-{}", index, subtask_id)
}

pub struct SequentialOrchestrator {
    services: Arc<RunServices>,
}

impl SequentialOrchestrator {
    pub fn new(services: Arc<RunServices>) -> Self {
        Self { services }
    }

    /// Resolve the chain order (explicit or default) and validate it.
    pub fn check(&self, parent_id: &str, subtask_ids: Option<Vec<String>>) -> Result<Vec<String>> {
        let ids = match subtask_ids {
            Some(ids) => ids,
            None => self.services.default_chain(parent_id)?,
        };
        self.services.resolve_chain(parent_id, &ids)?;
        Ok(ids)
    }

    pub async fn run(&self, ctx: &StepContext, request: &SequentialRequest) -> Result<ChainSummary> {
        let services = &self.services;
        let run_id = ctx.run_id();

        let chain: LoadedChain = ctx
            .run("load-context", || async {
                let resolved = services.resolve_chain(&request.parent_id, &request.subtask_ids)?;
                services.jobs.create(&NewJob {
                    workspace_id: resolved.workspace.id.clone(),
                    function_id: FunctionKind::Sequential.function_id().to_string(),
                    run_id: run_id.to_string(),
                    metadata: Some(json!({
                        "parentId": resolved.parent.id,
                        "subtaskIds": request.subtask_ids,
                        "total": resolved.subtasks.len(),
                    })),
                    max_attempts: services.limits.max_attempts,
                })?;
                // The run id marks which entries this chain owns.
                for subtask in &resolved.subtasks {
                    services.store.record_ai_execution(
                        &subtask.id,
                        AiExecutionStatus::Pending,
                        Some(&json!({ "runId": run_id })),
                        None,
                    )?;
                }
                Ok(LoadedChain {
                    workspace: resolved.workspace,
                    parent: resolved.parent,
                    subtasks: resolved.subtasks,
                })
            })
            .await?;
        services.jobs.mark_running(run_id, ctx.attempt())?;

        let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(chain.subtasks.len());
        for (index, subtask) in chain.subtasks.iter().enumerate() {
            let previous = PreviousTaskResult::fold(&outcomes, services.limits.digest_chars);
            let step = chain_step_name(index, &subtask.id);
            let outcome: TaskOutcome = ctx
                .run(&step, || self.execute_in_chain(ctx, &step, &chain, subtask, &previous))
                .await?;
            outcomes.push(outcome);
        }

        ctx.run("finalize", || async { self.finalize(run_id, &chain.parent, &outcomes) })
            .await
    }

    /// Run one chain entry. Model and output failures are recorded on the
    /// subtask and returned as `TaskOutcome::Failed`. Metering and status
    /// writes escape so the runtime retries the entry; the nested steps
    /// keep that retry from calling the model or billing twice.
    async fn execute_in_chain(
        &self,
        ctx: &StepContext,
        step: &str,
        chain: &LoadedChain,
        subtask: &Issue,
        previous: &[PreviousTaskResult],
    ) -> Result<TaskOutcome> {
        let services = &self.services;
        let run_id = ctx.run_id();
        services
            .store
            .set_ai_execution_status(&subtask.id, AiExecutionStatus::Running)?;

        let executed: Result<ModelResponse> = ctx
            .run(&format!("{}:execute", step), || async {
                let prompt =
                    PromptBuilder::build(&chain.workspace, Some(&chain.parent), subtask, previous);
                services.engine.execute(&prompt).await
            })
            .await;
        let response = match executed {
            Ok(response) => response,
            Err(e) => return self.record_failure(run_id, subtask, e),
        };

        // Usage is billed even when the output turns out unusable.
        let track_step = format!("{}:track-usage", step);
        let metering: MeterOutcome = ctx
            .run(&track_step, || async {
                services.meter(
                    &chain.workspace,
                    subtask,
                    &response,
                    format!("{}:{}", run_id, track_step),
                )
            })
            .await?;
        if let Some(reload) = &metering.reload_requested {
            ctx.send(
                &format!("{}:request-reload", step),
                AUTO_RELOAD_EVENT,
                &serde_json::to_value(reload)?,
            )?;
        }

        match self.record_success(run_id, chain, subtask, previous, &response).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.record_failure(run_id, subtask, e),
        }
    }

    fn record_failure(&self, run_id: &str, subtask: &Issue, err: Error) -> Result<TaskOutcome> {
        warn!(
            "Chain {} subtask {} failed, continuing: {}",
            run_id, subtask.identifier, err
        );
        let reason = err.to_string();
        self.services.store.record_ai_execution(
            &subtask.id,
            AiExecutionStatus::Failed,
            Some(&json!({ "runId": run_id, "error": reason })),
            Some(&format!("AI execution failed: {}", reason)),
        )?;
        Ok(TaskOutcome::Failed {
            issue_id: subtask.id.clone(),
            reason,
        })
    }

    async fn record_success(
        &self,
        run_id: &str,
        chain: &LoadedChain,
        subtask: &Issue,
        previous: &[PreviousTaskResult],
        response: &ModelResponse,
    ) -> Result<TaskOutcome> {
        let services = &self.services;
        let text = response.text.trim();
        if text.is_empty() {
            return Err(Error::Model("model returned no output".into()));
        }

        let attachment = services
            .save_attachment(&chain.workspace, &chain.parent, subtask, &response.text)
            .await;
        let summary = truncate_chars(text, services.limits.summary_chars);
        let blob = json!({
            "runId": run_id,
            "text": response.text,
            "model": response.model,
            "usage": response.usage,
            "attachmentKey": attachment.key(),
            "priorResults": previous.len(),
        });
        services.store.record_ai_execution(
            &subtask.id,
            AiExecutionStatus::Completed,
            Some(&blob),
            Some(&summary),
        )?;

        Ok(TaskOutcome::Succeeded {
            issue_id: subtask.id.clone(),
            identifier: subtask.identifier.clone(),
            title: subtask.title.clone(),
            output: text.to_string(),
            summary,
        })
    }

    fn finalize(&self, run_id: &str, parent: &Issue, outcomes: &[TaskOutcome]) -> Result<ChainSummary> {
        let total = outcomes.len();
        let completed = outcomes.iter().filter(|o| o.is_success()).count();
        let results = outcomes
            .iter()
            .map(|outcome| match outcome {
                TaskOutcome::Succeeded {
                    issue_id, summary, ..
                } => ChainItemSummary {
                    subtask_id: issue_id.clone(),
                    status: AiExecutionStatus::Completed,
                    summary: summary.clone(),
                },
                TaskOutcome::Failed { issue_id, reason } => ChainItemSummary {
                    subtask_id: issue_id.clone(),
                    status: AiExecutionStatus::Failed,
                    summary: reason.clone(),
                },
            })
            .collect();

        let summary = ChainSummary {
            run_id: run_id.to_string(),
            parent_id: parent.id.clone(),
            total,
            completed,
            failed: total - completed,
            results,
        };
        let value = serde_json::to_value(&summary)?;

        // Partial success still completes the job.
        if completed > 0 {
            self.services.jobs.complete(run_id, &value)?;
        } else {
            self.services.jobs.fail(
                run_id,
                &format!("All {} subtasks failed", total),
                Some(&value),
            )?;
        }
        info!(
            "Chain {} under {} finished: {}/{} completed",
            run_id, parent.identifier, completed, total
        );
        Ok(summary)
    }

    /// Failure hook for an aborted chain: fail the job and every entry this
    /// run left pending or running. Entries claimed by another run are
    /// left alone.
    pub fn on_failure(&self, request: &SequentialRequest, err: &Error) {
        let message = err.to_string();
        let store = &self.services.store;

        if !matches!(err, Error::Precondition(_)) {
            for id in &request.subtask_ids {
                let marked = store.get_issue(id).and_then(|issue| match issue {
                    Some(issue) if is_unsettled_in_run(&issue, &request.run_id) =>
                    {
                        store.record_ai_execution(
                            &issue.id,
                            AiExecutionStatus::Failed,
                            Some(&json!({ "runId": request.run_id, "error": message })),
                            Some(&format!("Chain aborted: {}", message)),
                        )
                    }
                    _ => Ok(false),
                });
                if let Err(e) = marked {
                    error!("Failure hook could not mark subtask {}: {}", id, e);
                }
            }
        }

        if let Err(e) = self.services.jobs.fail(&request.run_id, &message, None) {
            error!("Failure hook could not fail job for run {}: {}", request.run_id, e);
        }
    }
}

fn is_unsettled_in_run(issue: &Issue, run_id: &str) -> bool {
    let owned = issue
        .ai_execution_result
        .as_ref()
        .map(|result| result["runId"] == run_id)
        .unwrap_or(false);
    owned
        && matches!(
            issue.ai_execution_status,
            Some(AiExecutionStatus::Pending) | Some(AiExecutionStatus::Running)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{RunFinished, RUN_FINISHED_EVENT};
    use crate::testing::Fixture;
    use conductor_llm::ScriptedResponse;
    use conductor_store::JobStatus;

    fn chain_request(run_id: &str) -> SequentialRequest {
        SequentialRequest {
            parent_id: "p-1".into(),
            subtask_ids: vec!["s-1".into(), "s-2".into(), "s-3".into()],
            run_id: run_id.into(),
        }
    }

    async fn execute(fx: &Fixture, req: &SequentialRequest) -> Result<ChainSummary> {
        let sequential = SequentialOrchestrator::new(fx.services.clone());
        let body = &sequential;
        let result = fx
            .runtime
            .invoke(FunctionKind::Sequential.function_id(), &req.run_id, move |ctx| {
                async move { body.run(&ctx, req).await }
            })
            .await;
        if let Err(e) = &result {
            sequential.on_failure(req, e);
        }
        result
    }

    fn prior_section(prompt: &str) -> Option<&str> {
        prompt
            .find("# Completed Prior Subtasks")
            .map(|at| &prompt[at..])
    }

    #[tokio::test]
    async fn test_middle_failure_is_isolated() {
        let fx = Fixture::new(vec![
            ScriptedResponse::text("Three competitors found."),
            ScriptedResponse::error("model exploded"),
            ScriptedResponse::text("Email written."),
        ]);
        let summary = execute(&fx, &chain_request("run-1")).await.unwrap();

        assert_eq!((summary.total, summary.completed, summary.failed), (3, 2, 1));
        assert_eq!(summary.results[1].status, AiExecutionStatus::Failed);
        assert!(summary.results[1].summary.contains("model exploded"));

        let statuses: Vec<_> = ["s-1", "s-2", "s-3"]
            .iter()
            .map(|id| fx.store.get_issue(id).unwrap().unwrap().ai_execution_status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                Some(AiExecutionStatus::Completed),
                Some(AiExecutionStatus::Failed),
                Some(AiExecutionStatus::Completed),
            ]
        );
        let failed = fx.store.get_issue("s-2").unwrap().unwrap();
        assert!(failed.ai_execution_summary.unwrap().contains("model exploded"));

        let job = fx.store.get_job_by_run_id("run-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.unwrap();
        assert_eq!(result["completed"], 2);
        assert_eq!(result["failed"], 1);

        // The third prompt sees only the first, completed, subtask.
        let prompts = fx.user_prompts();
        assert_eq!(prompts.len(), 3);
        let third = prior_section(&prompts[2]).unwrap();
        assert!(third.contains("MKT-2: Research competitors"));
        assert!(third.contains("Three competitors found."));
        assert!(!third.contains("MKT-3"));
    }

    #[tokio::test]
    async fn test_prompts_list_prior_digests_in_order() {
        let fx = Fixture::new(vec![
            ScriptedResponse::text("alpha output"),
            ScriptedResponse::text("beta output"),
            ScriptedResponse::text("gamma output"),
        ]);
        execute(&fx, &chain_request("run-1")).await.unwrap();

        let prompts = fx.user_prompts();
        assert!(prior_section(&prompts[0]).is_none());

        let second = prior_section(&prompts[1]).unwrap();
        assert!(second.contains("alpha output"));
        assert!(!second.contains("beta output"));

        let third = prior_section(&prompts[2]).unwrap();
        let alpha = third.find("alpha output").unwrap();
        let beta = third.find("beta output").unwrap();
        assert!(alpha < beta);
    }

    #[tokio::test]
    async fn test_digests_are_truncated() {
        let long = "z".repeat(4_000);
        let fx = Fixture::new(vec![
            ScriptedResponse::text(&long),
            ScriptedResponse::text("short"),
        ]);
        let mut req = chain_request("run-1");
        req.subtask_ids.truncate(2);
        execute(&fx, &req).await.unwrap();

        let second = prior_section(&fx.user_prompts()[1]).unwrap().to_string();
        let zs = second.chars().filter(|c| *c == 'z').count();
        assert_eq!(zs, 1_499);

        // The stored summary uses its own, smaller budget.
        let first = fx.store.get_issue("s-1").unwrap().unwrap();
        assert_eq!(first.ai_execution_summary.unwrap().chars().count(), 500);
    }

    #[tokio::test]
    async fn test_all_failed_fails_job() {
        let fx = Fixture::new(vec![
            ScriptedResponse::error("a"),
            ScriptedResponse::error("b"),
            ScriptedResponse::text("  "),
        ]);
        let summary = execute(&fx, &chain_request("run-1")).await.unwrap();
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 3);

        let job = fx.store.get_job_by_run_id("run-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("All 3 subtasks failed"));
        assert_eq!(job.result.unwrap()["total"], 3);

        // The lifecycle event agrees with the job row.
        let events = fx.store.events_named(RUN_FINISHED_EVENT).unwrap();
        let finished: RunFinished = serde_json::from_value(events[0].payload.clone()).unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.error.as_deref(), Some("All 3 subtasks failed"));
    }

    #[tokio::test]
    async fn test_resume_continues_after_last_checkpoint() {
        let fx = Fixture::new(vec![
            ScriptedResponse::text("beta output"),
            ScriptedResponse::text("gamma output"),
        ]);

        // An earlier process finished the first subtask before it died.
        let done = TaskOutcome::Succeeded {
            issue_id: "s-1".into(),
            identifier: "MKT-2".into(),
            title: "Research competitors".into(),
            output: "alpha output from before the crash".into(),
            summary: "alpha output from before the crash".into(),
        };
        fx.store
            .save_step_result(
                FunctionKind::Sequential.function_id(),
                "run-1",
                &chain_step_name(0, "s-1"),
                &serde_json::to_string(&done).unwrap(),
            )
            .unwrap();

        let summary = execute(&fx, &chain_request("run-1")).await.unwrap();
        assert_eq!(summary.completed, 3);
        assert_eq!(fx.client.call_count(), 2);

        let prompts = fx.user_prompts();
        assert!(prompts[0].contains("MKT-3: Draft landing copy"));
        let rebuilt = prior_section(&prompts[0]).unwrap();
        assert!(rebuilt.contains("alpha output from before the crash"));
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let fx = Fixture::new(vec![
            ScriptedResponse::text("one"),
            ScriptedResponse::text("two"),
            ScriptedResponse::text("three"),
        ]);
        let first = execute(&fx, &chain_request("run-1")).await.unwrap();
        let second = execute(&fx, &chain_request("run-1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fx.client.call_count(), 3);
        assert_eq!(fx.store.count_jobs_for_run("run-1").unwrap(), 1);
        assert_eq!(fx.store.list_usage("ws-1", 10).unwrap().len(), 3);
    }

    #[test]
    fn test_check_resolves_default_order_and_rejects_bad_chains() {
        let fx = Fixture::new(vec![]);
        let sequential = SequentialOrchestrator::new(fx.services.clone());

        assert_eq!(
            sequential.check("p-1", None).unwrap(),
            vec!["s-1", "s-2", "s-3"]
        );

        let manual = Some(vec!["s-1".to_string(), "s-manual".to_string()]);
        assert!(matches!(sequential.check("p-1", manual), Err(Error::Precondition(_))));

        let repeated = Some(vec!["s-1".to_string(), "s-1".to_string()]);
        assert!(matches!(sequential.check("p-1", repeated), Err(Error::Precondition(_))));

        assert!(matches!(
            sequential.check("p-1", Some(vec![])),
            Err(Error::Precondition(_))
        ));
        assert!(matches!(sequential.check("missing", None), Err(Error::Precondition(_))));
        assert!(fx.store.list_jobs("ws-1", 10).unwrap().is_empty());
    }

    /// Second connection that makes every ledger insert fail until dropped.
    fn take_ledger_offline(fx: &Fixture) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(fx.store.db_path()).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER ledger_offline BEFORE INSERT ON usage_ledger
             BEGIN SELECT RAISE(ABORT, 'ledger offline'); END;",
        )
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_metering_failure_is_retried_not_lost() {
        let fx = Fixture::new(vec![
            ScriptedResponse::text("one"),
            ScriptedResponse::text("two"),
            ScriptedResponse::text("three"),
        ]);
        let sequential = SequentialOrchestrator::new(fx.services.clone());
        let req = chain_request("run-1");
        let function_id = FunctionKind::Sequential.function_id();

        let ledger = take_ledger_offline(&fx);
        let first = StepContext::new(fx.store.clone(), function_id, "run-1", 1);
        let err = sequential.run(&first, &req).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("ledger offline"));
        // The entry is neither failed nor memoized.
        let s1 = fx.store.get_issue("s-1").unwrap().unwrap();
        assert_eq!(s1.ai_execution_status, Some(AiExecutionStatus::Running));
        assert!(!fx
            .store
            .list_step_names(function_id, "run-1")
            .unwrap()
            .contains(&chain_step_name(0, "s-1")));

        ledger.execute_batch("DROP TRIGGER ledger_offline;").unwrap();
        let second = StepContext::new(fx.store.clone(), function_id, "run-1", 2);
        let summary = sequential.run(&second, &req).await.unwrap();

        assert_eq!(summary.completed, 3);
        assert_eq!(fx.client.call_count(), 3);
        assert_eq!(fx.store.list_usage("ws-1", 10).unwrap().len(), 3);
        let sub = fx.store.get_subscription("owner-1").unwrap().unwrap();
        assert_eq!(sub.tokens_remaining, 1_000_000 - 3 * 150);
    }

    #[tokio::test]
    async fn test_escaping_error_aborts_the_chain() {
        let fx = Fixture::new(vec![ScriptedResponse::text("one")]);
        let _ledger = take_ledger_offline(&fx);

        let err = execute(&fx, &chain_request("run-1")).await.unwrap_err();
        assert!(err.to_string().contains("ledger offline"));
        // Retries replay the memoized model call.
        assert_eq!(fx.client.call_count(), 1);

        let job = fx.store.get_job_by_run_id("run-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        for id in ["s-1", "s-2", "s-3"] {
            let issue = fx.store.get_issue(id).unwrap().unwrap();
            assert_eq!(issue.ai_execution_status, Some(AiExecutionStatus::Failed));
            assert!(issue.ai_execution_summary.unwrap().starts_with("Chain aborted"));
        }
    }

    #[tokio::test]
    async fn test_failure_hook_leaves_other_runs_entries_alone() {
        let fx = Fixture::new(vec![]);
        let mine = json!({ "runId": "run-1" });
        let theirs = json!({ "runId": "run-2" });
        fx.store
            .record_ai_execution("s-1", AiExecutionStatus::Pending, Some(&mine), None)
            .unwrap();
        fx.store
            .record_ai_execution("s-2", AiExecutionStatus::Running, Some(&theirs), None)
            .unwrap();

        let sequential = SequentialOrchestrator::new(fx.services.clone());
        sequential.on_failure(
            &chain_request("run-1"),
            &Error::Database("disk I/O error".into()),
        );

        let s1 = fx.store.get_issue("s-1").unwrap().unwrap();
        assert_eq!(s1.ai_execution_status, Some(AiExecutionStatus::Failed));
        let s2 = fx.store.get_issue("s-2").unwrap().unwrap();
        assert_eq!(s2.ai_execution_status, Some(AiExecutionStatus::Running));
        assert_eq!(s2.ai_execution_result.unwrap()["runId"], "run-2");
        let s3 = fx.store.get_issue("s-3").unwrap().unwrap();
        assert_eq!(s3.ai_execution_status, None);
    }

    #[tokio::test]
    async fn test_low_balance_requests_one_reload_per_entry() {
        let fx = Fixture::new(vec![
            ScriptedResponse::text("one"),
            ScriptedResponse::text("two"),
            ScriptedResponse::text("three"),
        ]);
        fx.arm_auto_reload();
        execute(&fx, &chain_request("run-1")).await.unwrap();
        execute(&fx, &chain_request("run-1")).await.unwrap();

        let reloads = fx.store.events_named(AUTO_RELOAD_EVENT).unwrap();
        assert_eq!(reloads.len(), 3);
        assert_eq!(reloads[0].payload["ownerId"], "owner-1");
        assert_eq!(reloads[0].payload["amount"], 5_000);
    }
}
