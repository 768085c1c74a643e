//! SQLite-backed store for orchestration state.
//!
//! A single connection guarded by a mutex. Every multi-statement
//! read-modify-write (usage recording, reload crediting) runs inside one
//! transaction while the lock is held, so balance updates are atomic with
//! respect to every other caller of the same store.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::schema::{BILLING_SCHEMA_SQL, BOARD_SCHEMA_SQL, JOBS_SCHEMA_SQL, RUNTIME_SCHEMA_SQL};
use crate::types::*;
use conductor_core::{Error, Result};

/// Outbox deliveries attempted before an event is parked as dead.
pub const MAX_EVENT_ATTEMPTS: u32 = 5;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn to_json_text(value: Option<&serde_json::Value>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Error::from)
}

fn parse_json(text: Option<String>) -> Option<serde_json::Value> {
    text.and_then(|s| serde_json::from_str(&s).ok())
}

impl SqliteStore {
    /// Open or create the store. The file will be `db_dir/conductor.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("conductor.db");

        let conn = Connection::open(&db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        Self::init_schema(&conn)?;

        info!("SqliteStore initialized: path={}", db_path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// In-memory store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!(
            "{}\n{}\n{}\n{}",
            BOARD_SCHEMA_SQL, JOBS_SCHEMA_SQL, BILLING_SCHEMA_SQL, RUNTIME_SCHEMA_SQL
        );
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------------------------------------------------------
    // Workspaces & issues
    // ---------------------------------------------------------------

    pub fn insert_workspace(&self, workspace: &Workspace) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO workspaces (id, owner_id, name, persona, brand_summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                workspace.id,
                workspace.owner_id,
                workspace.name,
                workspace.persona,
                workspace.brand_summary,
                workspace.created_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM workspaces WHERE id = ?1")
            .map_err(db_err)?;
        stmt.query_row(params![id], Self::row_to_workspace)
            .optional()
            .map_err(db_err)
    }

    pub fn insert_issue(&self, issue: NewIssue) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO issues (id, workspace_id, parent_id, identifier, title, description,
                                 ai_instructions, ai_assignable, position, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                issue.id,
                issue.workspace_id,
                issue.parent_id,
                issue.identifier,
                issue.title,
                issue.description,
                issue.ai_instructions,
                issue.ai_assignable,
                issue.position,
                now_millis(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM issues WHERE id = ?1")
            .map_err(db_err)?;
        stmt.query_row(params![id], Self::row_to_issue)
            .optional()
            .map_err(db_err)
    }

    /// Subtasks of a parent issue in board position order.
    pub fn get_subtasks(&self, parent_id: &str) -> Result<Vec<Issue>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM issues WHERE parent_id = ?1 ORDER BY position ASC, created_at ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![parent_id], Self::row_to_issue)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Set a subtask's AI execution status without touching its result.
    pub fn set_ai_execution_status(&self, issue_id: &str, status: AiExecutionStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE issues SET ai_execution_status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_millis(), issue_id],
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// Record a subtask's execution outcome (status, result blob, summary).
    pub fn record_ai_execution(
        &self,
        issue_id: &str,
        status: AiExecutionStatus,
        result: Option<&serde_json::Value>,
        summary: Option<&str>,
    ) -> Result<bool> {
        let result_json = to_json_text(result)?;
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE issues
                 SET ai_execution_status = ?1, ai_execution_result = ?2,
                     ai_execution_summary = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![status.as_str(), result_json, summary, now_millis(), issue_id],
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    // ---------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------

    /// Insert a pending job row unless one already exists for the run id.
    /// Returns whether a row was created.
    pub fn insert_job_if_absent(&self, job: &NewJob, job_id: &str) -> Result<bool> {
        let metadata = to_json_text(job.metadata.as_ref())?;
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "INSERT INTO jobs (id, workspace_id, function_id, run_id, status, metadata_json,
                                   attempt, max_attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6, ?7)
                 ON CONFLICT(run_id) DO NOTHING",
                params![
                    job_id,
                    job.workspace_id,
                    job.function_id,
                    job.run_id,
                    metadata,
                    job.max_attempts,
                    now_millis(),
                ],
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    pub fn get_job_by_run_id(&self, run_id: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM jobs WHERE run_id = ?1")
            .map_err(db_err)?;
        stmt.query_row(params![run_id], Self::row_to_job)
            .optional()
            .map_err(db_err)
    }

    pub fn count_jobs_for_run(&self, run_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    pub fn list_jobs(&self, workspace_id: &str, limit: usize) -> Result<Vec<JobRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM jobs WHERE workspace_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![workspace_id, limit as i64], Self::row_to_job)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Move a non-terminal job to running and record the attempt number.
    pub fn mark_job_running(&self, run_id: &str, attempt: u32) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE jobs SET status = 'running', attempt = ?1,
                                 started_at = COALESCE(started_at, ?2)
                 WHERE run_id = ?3 AND status IN ('pending', 'running')",
                params![attempt, now_millis(), run_id],
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// Apply a terminal transition. Only a non-terminal row transitions;
    /// returns false when the row was already terminal (or missing).
    pub fn finish_job(
        &self,
        run_id: &str,
        status: JobStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::Internal(format!(
                "finish_job called with non-terminal status {}",
                status
            )));
        }
        let result_json = to_json_text(result)?;
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE jobs SET status = ?1, result_json = ?2, error = ?3, completed_at = ?4
                 WHERE run_id = ?5 AND status IN ('pending', 'running')",
                params![status.as_str(), result_json, error, now_millis(), run_id],
            )
            .map_err(db_err)?;
        if count == 0 {
            debug!("Job {} already terminal; {} transition ignored", run_id, status);
        }
        Ok(count > 0)
    }

    // ---------------------------------------------------------------
    // Usage ledger & balances
    // ---------------------------------------------------------------

    /// Append a ledger row and decrement the owner's balance (floored at
    /// zero) in one transaction. A repeated `idempotency_key` changes
    /// nothing and reports `inserted = false`.
    pub fn record_usage(
        &self,
        entry: &UsageEntry,
        owner_id: &str,
        idempotency_key: &str,
    ) -> Result<UsageRecording> {
        let now = now_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let inserted = tx
            .execute(
                "INSERT INTO usage_ledger (workspace_id, model, input_tokens, output_tokens,
                     cache_creation_input_tokens, cache_read_input_tokens, total_tokens,
                     cost_cents, source, idempotency_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(idempotency_key) DO NOTHING",
                params![
                    entry.workspace_id,
                    entry.model,
                    entry.input_tokens,
                    entry.output_tokens,
                    entry.cache_creation_input_tokens,
                    entry.cache_read_input_tokens,
                    entry.total_tokens,
                    entry.cost_cents,
                    entry.source,
                    idempotency_key,
                    now,
                ],
            )
            .map_err(db_err)?
            > 0;

        let balance_before: Option<i64> = tx
            .query_row(
                "SELECT tokens_remaining FROM subscriptions WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        if inserted {
            if let Some(balance) = balance_before {
                let new_balance = floored_balance(balance, entry.total_tokens);
                tx.execute(
                    "UPDATE subscriptions SET tokens_remaining = ?1, updated_at = ?2
                     WHERE owner_id = ?3",
                    params![new_balance, now, owner_id],
                )
                .map_err(db_err)?;
            }
        } else {
            debug!("Usage already recorded for key {}", idempotency_key);
        }

        let subscription = tx
            .query_row(
                "SELECT * FROM subscriptions WHERE owner_id = ?1",
                params![owner_id],
                Self::row_to_subscription,
            )
            .optional()
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;

        Ok(UsageRecording {
            inserted,
            balance_before,
            subscription,
        })
    }

    pub fn list_usage(&self, workspace_id: &str, limit: usize) -> Result<Vec<LedgerRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM usage_ledger WHERE workspace_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![workspace_id, limit as i64], Self::row_to_ledger)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn usage_summary(&self, workspace_id: &str) -> Result<UsageSummary> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cache_creation_input_tokens), 0),
                    COALESCE(SUM(cache_read_input_tokens), 0),
                    COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(cost_cents), 0)
             FROM usage_ledger WHERE workspace_id = ?1",
            params![workspace_id],
            |row| {
                Ok(UsageSummary {
                    entries: row.get(0)?,
                    input_tokens: row.get(1)?,
                    output_tokens: row.get(2)?,
                    cache_creation_input_tokens: row.get(3)?,
                    cache_read_input_tokens: row.get(4)?,
                    total_tokens: row.get(5)?,
                    cost_cents: row.get(6)?,
                })
            },
        )
        .map_err(db_err)
    }

    pub fn upsert_subscription(&self, sub: &Subscription) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subscriptions (owner_id, tokens_remaining, auto_reload_enabled,
                 auto_reload_threshold, auto_reload_amount, max_monthly_auto_reload,
                 monthly_auto_reloaded, auto_reload_month, payment_method_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(owner_id) DO UPDATE SET
                 tokens_remaining = excluded.tokens_remaining,
                 auto_reload_enabled = excluded.auto_reload_enabled,
                 auto_reload_threshold = excluded.auto_reload_threshold,
                 auto_reload_amount = excluded.auto_reload_amount,
                 max_monthly_auto_reload = excluded.max_monthly_auto_reload,
                 monthly_auto_reloaded = excluded.monthly_auto_reloaded,
                 auto_reload_month = excluded.auto_reload_month,
                 payment_method_id = excluded.payment_method_id,
                 updated_at = excluded.updated_at",
            params![
                sub.owner_id,
                sub.tokens_remaining.max(0),
                sub.auto_reload_enabled,
                sub.auto_reload_threshold,
                sub.auto_reload_amount,
                sub.max_monthly_auto_reload,
                sub.monthly_auto_reloaded,
                sub.auto_reload_month,
                sub.payment_method_id,
                now_millis(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_subscription(&self, owner_id: &str) -> Result<Option<Subscription>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM subscriptions WHERE owner_id = ?1")
            .map_err(db_err)?;
        stmt.query_row(params![owner_id], Self::row_to_subscription)
            .optional()
            .map_err(db_err)
    }

    /// Credit a completed auto-reload: add `amount` tokens and count them
    /// against `month`. Re-checks the monthly cap inside the transaction and
    /// returns the updated subscription, or `None` if the cap would be exceeded.
    pub fn credit_auto_reload(
        &self,
        owner_id: &str,
        amount: i64,
        month: &str,
    ) -> Result<Option<Subscription>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let sub = tx
            .query_row(
                "SELECT * FROM subscriptions WHERE owner_id = ?1",
                params![owner_id],
                Self::row_to_subscription,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("subscription for owner {}", owner_id)))?;

        let reloaded = sub.reloaded_in_month(month);
        if let Some(cap) = sub.max_monthly_auto_reload {
            if reloaded + amount > cap {
                warn!(
                    "Auto-reload for {} refused: {} + {} exceeds monthly cap {}",
                    owner_id, reloaded, amount, cap
                );
                return Ok(None);
            }
        }

        tx.execute(
            "UPDATE subscriptions
             SET tokens_remaining = tokens_remaining + ?1,
                 monthly_auto_reloaded = ?2,
                 auto_reload_month = ?3,
                 updated_at = ?4
             WHERE owner_id = ?5",
            params![amount, reloaded + amount, month, now_millis(), owner_id],
        )
        .map_err(db_err)?;

        let updated = tx
            .query_row(
                "SELECT * FROM subscriptions WHERE owner_id = ?1",
                params![owner_id],
                Self::row_to_subscription,
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(Some(updated))
    }

    // ---------------------------------------------------------------
    // Step memos
    // ---------------------------------------------------------------

    pub fn get_step_result(
        &self,
        function_id: &str,
        run_id: &str,
        step_name: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT output_json FROM step_results
                 WHERE function_id = ?1 AND run_id = ?2 AND step_name = ?3",
            )
            .map_err(db_err)?;
        stmt.query_row(params![function_id, run_id, step_name], |row| row.get(0))
            .optional()
            .map_err(db_err)
    }

    /// Persist a step's output. The first write for a name wins; returns
    /// the stored output so a concurrent duplicate replays the winner.
    pub fn save_step_result(
        &self,
        function_id: &str,
        run_id: &str,
        step_name: &str,
        output_json: &str,
    ) -> Result<String> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO step_results (function_id, run_id, step_name, seq, output_json, created_at)
             VALUES (?1, ?2, ?3,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM step_results
                      WHERE function_id = ?1 AND run_id = ?2),
                     ?4, ?5)
             ON CONFLICT(function_id, run_id, step_name) DO NOTHING",
            params![function_id, run_id, step_name, output_json, now_millis()],
        )
        .map_err(db_err)?;
        conn.query_row(
            "SELECT output_json FROM step_results
             WHERE function_id = ?1 AND run_id = ?2 AND step_name = ?3",
            params![function_id, run_id, step_name],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// Memoized step names of one function's run, in completion order.
    pub fn list_step_names(&self, function_id: &str, run_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT step_name FROM step_results
                 WHERE function_id = ?1 AND run_id = ?2 ORDER BY seq",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![function_id, run_id], |row| row.get(0))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Event outbox
    // ---------------------------------------------------------------

    /// Queue an event. With a dedupe key, a second enqueue is a no-op.
    pub fn enqueue_event(
        &self,
        name: &str,
        payload: &serde_json::Value,
        dedupe_key: Option<&str>,
    ) -> Result<bool> {
        let payload_json = serde_json::to_string(payload)?;
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "INSERT INTO event_outbox (name, payload_json, dedupe_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(dedupe_key) DO NOTHING",
                params![name, payload_json, dedupe_key, now_millis()],
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    pub fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM event_outbox WHERE status = 'pending' ORDER BY id ASC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_event)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn events_named(&self, name: &str) -> Result<Vec<OutboxEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM event_outbox WHERE name = ?1 ORDER BY id ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![name], Self::row_to_event)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn mark_event_delivered(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE event_outbox SET status = 'delivered', attempts = attempts + 1,
                                     delivered_at = ?1
             WHERE id = ?2",
            params![now_millis(), id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Record a failed delivery; parks the event after `MAX_EVENT_ATTEMPTS`.
    pub fn mark_event_failed(&self, id: i64, error: &str) -> Result<OutboxStatus> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE event_outbox
             SET attempts = attempts + 1, last_error = ?1,
                 status = CASE WHEN attempts + 1 >= ?2 THEN 'dead' ELSE 'pending' END
             WHERE id = ?3",
            params![error, MAX_EVENT_ATTEMPTS, id],
        )
        .map_err(db_err)?;
        let status: String = conn
            .query_row(
                "SELECT status FROM event_outbox WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        status.parse().map_err(Error::Database)
    }

    // ---------------------------------------------------------------
    // Attachments
    // ---------------------------------------------------------------

    /// Index an attachment blob; re-uploading the same key replaces the row.
    pub fn upsert_attachment(&self, record: &AttachmentRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO attachments (workspace_id, issue_id, filename, storage_key, mime_type,
                                      size_bytes, content_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(storage_key) DO UPDATE SET
                 mime_type = excluded.mime_type,
                 size_bytes = excluded.size_bytes,
                 content_hash = excluded.content_hash,
                 created_at = excluded.created_at",
            params![
                record.workspace_id,
                record.issue_id,
                record.filename,
                record.storage_key,
                record.mime_type,
                record.size_bytes,
                record.content_hash,
                now_millis(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn list_attachments(&self, issue_id: &str) -> Result<Vec<AttachmentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM attachments WHERE issue_id = ?1 ORDER BY id ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![issue_id], |row| {
                Ok(AttachmentRecord {
                    workspace_id: row.get("workspace_id")?,
                    issue_id: row.get("issue_id")?,
                    filename: row.get("filename")?,
                    storage_key: row.get("storage_key")?,
                    mime_type: row.get("mime_type")?,
                    size_bytes: row.get("size_bytes")?,
                    content_hash: row.get("content_hash")?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Row mapping
    // ---------------------------------------------------------------

    fn row_to_workspace(row: &Row<'_>) -> rusqlite::Result<Workspace> {
        Ok(Workspace {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            name: row.get("name")?,
            persona: row.get("persona")?,
            brand_summary: row.get("brand_summary")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_issue(row: &Row<'_>) -> rusqlite::Result<Issue> {
        let status: Option<String> = row.get("ai_execution_status")?;
        Ok(Issue {
            id: row.get("id")?,
            workspace_id: row.get("workspace_id")?,
            parent_id: row.get("parent_id")?,
            identifier: row.get("identifier")?,
            title: row.get("title")?,
            description: row.get("description")?,
            ai_instructions: row.get("ai_instructions")?,
            ai_assignable: row.get("ai_assignable")?,
            ai_execution_status: status.and_then(|s| s.parse().ok()),
            ai_execution_result: parse_json(row.get("ai_execution_result")?),
            ai_execution_summary: row.get("ai_execution_summary")?,
            position: row.get("position")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
        let status: String = row.get("status")?;
        Ok(JobRecord {
            id: row.get("id")?,
            workspace_id: row.get("workspace_id")?,
            function_id: row.get("function_id")?,
            run_id: row.get("run_id")?,
            status: status.parse().unwrap_or(JobStatus::Failed),
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            metadata: parse_json(row.get("metadata_json")?),
            result: parse_json(row.get("result_json")?),
            error: row.get("error")?,
            attempt: row.get("attempt")?,
            max_attempts: row.get("max_attempts")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_ledger(row: &Row<'_>) -> rusqlite::Result<LedgerRow> {
        Ok(LedgerRow {
            id: row.get("id")?,
            entry: UsageEntry {
                workspace_id: row.get("workspace_id")?,
                model: row.get("model")?,
                input_tokens: row.get("input_tokens")?,
                output_tokens: row.get("output_tokens")?,
                cache_creation_input_tokens: row.get("cache_creation_input_tokens")?,
                cache_read_input_tokens: row.get("cache_read_input_tokens")?,
                total_tokens: row.get("total_tokens")?,
                cost_cents: row.get("cost_cents")?,
                source: row.get("source")?,
            },
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_subscription(row: &Row<'_>) -> rusqlite::Result<Subscription> {
        Ok(Subscription {
            owner_id: row.get("owner_id")?,
            tokens_remaining: row.get("tokens_remaining")?,
            auto_reload_enabled: row.get("auto_reload_enabled")?,
            auto_reload_threshold: row.get("auto_reload_threshold")?,
            auto_reload_amount: row.get("auto_reload_amount")?,
            max_monthly_auto_reload: row.get("max_monthly_auto_reload")?,
            monthly_auto_reloaded: row.get("monthly_auto_reloaded")?,
            auto_reload_month: row.get("auto_reload_month")?,
            payment_method_id: row.get("payment_method_id")?,
        })
    }

    fn row_to_event(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
        let status: String = row.get("status")?;
        let payload: String = row.get("payload_json")?;
        Ok(OutboxEvent {
            id: row.get("id")?,
            name: row.get("name")?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            dedupe_key: row.get("dedupe_key")?,
            status: status.parse().unwrap_or(OutboxStatus::Pending),
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn seed_board(store: &SqliteStore) {
        store
            .insert_workspace(&Workspace {
                id: "ws-1".into(),
                owner_id: "owner-1".into(),
                name: "Acme".into(),
                persona: Some("Growth marketer".into()),
                brand_summary: None,
                created_at: 0,
            })
            .unwrap();
        store
            .insert_issue(NewIssue {
                id: "parent".into(),
                workspace_id: "ws-1".into(),
                identifier: "MKT-1".into(),
                title: "Launch campaign".into(),
                ..Default::default()
            })
            .unwrap();
        for (i, id) in ["b", "a", "c"].iter().enumerate() {
            store
                .insert_issue(NewIssue {
                    id: id.to_string(),
                    workspace_id: "ws-1".into(),
                    parent_id: Some("parent".into()),
                    identifier: format!("MKT-{}", i + 2),
                    title: format!("Subtask {}", id),
                    ai_assignable: true,
                    position: i as i64,
                    ..Default::default()
                })
                .unwrap();
        }
    }

    fn new_job(run_id: &str) -> NewJob {
        NewJob {
            workspace_id: "ws-1".into(),
            function_id: "execute-subtask".into(),
            run_id: run_id.into(),
            metadata: Some(serde_json::json!({"subtaskId": "a"})),
            max_attempts: 3,
        }
    }

    fn entry(total: i64) -> UsageEntry {
        UsageEntry {
            workspace_id: "ws-1".into(),
            model: "claude-sonnet-4-20250514".into(),
            input_tokens: total / 2,
            output_tokens: total - total / 2,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
            total_tokens: total,
            cost_cents: 3,
            source: "test".into(),
        }
    }

    #[test]
    fn test_subtasks_in_position_order() {
        let (store, _dir) = test_store();
        seed_board(&store);
        let ids: Vec<String> = store
            .get_subtasks("parent")
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_record_ai_execution() {
        let (store, _dir) = test_store();
        seed_board(&store);
        store
            .set_ai_execution_status("a", AiExecutionStatus::Running)
            .unwrap();
        assert_eq!(
            store.get_issue("a").unwrap().unwrap().ai_execution_status,
            Some(AiExecutionStatus::Running)
        );

        let result = serde_json::json!({"text": "done"});
        store
            .record_ai_execution("a", AiExecutionStatus::Completed, Some(&result), Some("done"))
            .unwrap();
        let issue = store.get_issue("a").unwrap().unwrap();
        assert_eq!(issue.ai_execution_status, Some(AiExecutionStatus::Completed));
        assert_eq!(issue.ai_execution_result.unwrap()["text"], "done");
        assert_eq!(issue.ai_execution_summary.as_deref(), Some("done"));
    }

    #[test]
    fn test_job_insert_is_idempotent_per_run_id() {
        let (store, _dir) = test_store();
        assert!(store.insert_job_if_absent(&new_job("run-1"), "job-a").unwrap());
        assert!(!store.insert_job_if_absent(&new_job("run-1"), "job-b").unwrap());
        assert_eq!(store.count_jobs_for_run("run-1").unwrap(), 1);

        let job = store.get_job_by_run_id("run-1").unwrap().unwrap();
        assert_eq!(job.id, "job-a");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, 3);
    }

    #[test]
    fn test_job_terminal_transition_happens_once() {
        let (store, _dir) = test_store();
        store.insert_job_if_absent(&new_job("run-1"), "job-a").unwrap();
        assert!(store.mark_job_running("run-1", 1).unwrap());

        let result = serde_json::json!({"completed": 1});
        assert!(store
            .finish_job("run-1", JobStatus::Completed, Some(&result), None)
            .unwrap());
        assert!(!store
            .finish_job("run-1", JobStatus::Failed, None, Some("late failure"))
            .unwrap());
        assert!(!store.mark_job_running("run-1", 2).unwrap());

        let job = store.get_job_by_run_id("run-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());
        assert_eq!(job.attempt, 1);
    }

    #[test]
    fn test_finish_job_rejects_non_terminal_status() {
        let (store, _dir) = test_store();
        store.insert_job_if_absent(&new_job("run-1"), "job-a").unwrap();
        assert!(store.finish_job("run-1", JobStatus::Running, None, None).is_err());
    }

    #[test]
    fn test_record_usage_deducts_and_floors() {
        let (store, _dir) = test_store();
        store
            .upsert_subscription(&Subscription::new("owner-1", 1_000))
            .unwrap();

        let first = store.record_usage(&entry(400), "owner-1", "run-1:track").unwrap();
        assert!(first.inserted);
        assert_eq!(first.balance_before, Some(1_000));
        assert_eq!(first.subscription.unwrap().tokens_remaining, 600);

        let second = store.record_usage(&entry(5_000), "owner-1", "run-2:track").unwrap();
        assert_eq!(second.subscription.unwrap().tokens_remaining, 0);
    }

    #[test]
    fn test_record_usage_replay_does_not_double_charge() {
        let (store, _dir) = test_store();
        store
            .upsert_subscription(&Subscription::new("owner-1", 1_000))
            .unwrap();

        store.record_usage(&entry(100), "owner-1", "run-1:track").unwrap();
        let replay = store.record_usage(&entry(100), "owner-1", "run-1:track").unwrap();
        assert!(!replay.inserted);
        assert_eq!(replay.subscription.unwrap().tokens_remaining, 900);
        assert_eq!(store.usage_summary("ws-1").unwrap().entries, 1);
    }

    #[test]
    fn test_record_usage_without_subscription_still_appends() {
        let (store, _dir) = test_store();
        let rec = store.record_usage(&entry(10), "nobody", "k").unwrap();
        assert!(rec.inserted);
        assert!(rec.subscription.is_none());
        let rows = store.list_usage("ws-1", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry.total_tokens, 10);
    }

    #[test]
    fn test_ledger_is_append_only() {
        let (store, _dir) = test_store();
        store.record_usage(&entry(10), "nobody", "k").unwrap();
        let conn = store.conn.lock();
        let res = conn.execute("UPDATE usage_ledger SET cost_cents = 0", []);
        assert!(res.is_err());
    }

    #[test]
    fn test_credit_auto_reload_respects_cap() {
        let (store, _dir) = test_store();
        let mut sub = Subscription::new("owner-1", 10);
        sub.auto_reload_enabled = true;
        sub.max_monthly_auto_reload = Some(150_000);
        sub.monthly_auto_reloaded = 100_000;
        sub.auto_reload_month = Some("2026-10".into());
        store.upsert_subscription(&sub).unwrap();

        let updated = store
            .credit_auto_reload("owner-1", 50_000, "2026-10")
            .unwrap()
            .unwrap();
        assert_eq!(updated.tokens_remaining, 50_010);
        assert_eq!(updated.monthly_auto_reloaded, 150_000);

        assert!(store
            .credit_auto_reload("owner-1", 1, "2026-10")
            .unwrap()
            .is_none());

        // New month starts from zero.
        let next = store
            .credit_auto_reload("owner-1", 50_000, "2026-11")
            .unwrap()
            .unwrap();
        assert_eq!(next.monthly_auto_reloaded, 50_000);
        assert_eq!(next.auto_reload_month.as_deref(), Some("2026-11"));
    }

    #[test]
    fn test_step_results_first_write_wins() {
        let (store, _dir) = test_store();
        assert!(store.get_step_result("fn-a", "run-1", "execute").unwrap().is_none());
        let stored = store.save_step_result("fn-a", "run-1", "execute", "\"first\"").unwrap();
        assert_eq!(stored, "\"first\"");
        let stored = store.save_step_result("fn-a", "run-1", "execute", "\"second\"").unwrap();
        assert_eq!(stored, "\"first\"");
        store.save_step_result("fn-a", "run-1", "finalize", "null").unwrap();
        assert_eq!(
            store.list_step_names("fn-a", "run-1").unwrap(),
            vec!["execute", "finalize"]
        );
    }

    #[test]
    fn test_step_results_are_scoped_by_function() {
        let (store, _dir) = test_store();
        store.save_step_result("fn-a", "run-1", "load-context", "1").unwrap();
        assert!(store.get_step_result("fn-b", "run-1", "load-context").unwrap().is_none());
        let stored = store.save_step_result("fn-b", "run-1", "load-context", "2").unwrap();
        assert_eq!(stored, "2");
        assert_eq!(
            store.get_step_result("fn-a", "run-1", "load-context").unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    fn test_outbox_dedupe_and_dead_letter() {
        let (store, _dir) = test_store();
        let payload = serde_json::json!({"ownerId": "owner-1"});
        assert!(store.enqueue_event("billing/auto-reload.requested", &payload, Some("k1")).unwrap());
        assert!(!store.enqueue_event("billing/auto-reload.requested", &payload, Some("k1")).unwrap());
        assert!(store.enqueue_event("run/finished", &payload, None).unwrap());
        assert!(store.enqueue_event("run/finished", &payload, None).unwrap());

        let pending = store.pending_events(10).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].payload["ownerId"], "owner-1");

        let id = pending[0].id;
        for _ in 0..MAX_EVENT_ATTEMPTS - 1 {
            assert_eq!(store.mark_event_failed(id, "boom").unwrap(), OutboxStatus::Pending);
        }
        assert_eq!(store.mark_event_failed(id, "boom").unwrap(), OutboxStatus::Dead);

        store.mark_event_delivered(pending[1].id).unwrap();
        assert_eq!(store.pending_events(10).unwrap().len(), 1);
    }

    #[test]
    fn test_attachment_upsert() {
        let (store, _dir) = test_store();
        let mut record = AttachmentRecord {
            workspace_id: "ws-1".into(),
            issue_id: "parent".into(),
            filename: "MKT-2-result.md".into(),
            storage_key: "ws-1/parent/MKT-2-result.md".into(),
            mime_type: "text/markdown".into(),
            size_bytes: 10,
            content_hash: "aa".into(),
        };
        store.upsert_attachment(&record).unwrap();
        record.size_bytes = 20;
        store.upsert_attachment(&record).unwrap();
        let list = store.list_attachments("parent").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].size_bytes, 20);
    }
}
