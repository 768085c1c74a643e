//! Database schema SQL.

/// Board rows the orchestrators read and drive: workspaces and issues.
/// A subtask is an issue whose `parent_id` is set.
pub const BOARD_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    persona TEXT,
    brand_summary TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS issues (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    parent_id TEXT REFERENCES issues(id) ON DELETE CASCADE,
    identifier TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    ai_instructions TEXT,
    ai_assignable INTEGER NOT NULL DEFAULT 0,
    ai_execution_status TEXT,
    ai_execution_result TEXT,
    ai_execution_summary TEXT,
    position INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_issues_parent ON issues(parent_id, position);
CREATE INDEX IF NOT EXISTS idx_issues_workspace ON issues(workspace_id);
"#;

/// Job tracker: one row per orchestration invocation, unique per run id.
pub const JOBS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    function_id TEXT NOT NULL,
    run_id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    metadata_json TEXT,
    result_json TEXT,
    error TEXT,
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_workspace ON jobs(workspace_id, created_at);
"#;

/// Metering: append-only usage ledger and prepaid balances.
pub const BILLING_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS usage_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cache_creation_input_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_input_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL,
    cost_cents INTEGER NOT NULL,
    source TEXT NOT NULL,
    idempotency_key TEXT UNIQUE,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_workspace ON usage_ledger(workspace_id, created_at);

CREATE TRIGGER IF NOT EXISTS usage_ledger_no_update BEFORE UPDATE ON usage_ledger BEGIN
    SELECT RAISE(ABORT, 'usage_ledger is append-only');
END;

CREATE TABLE IF NOT EXISTS subscriptions (
    owner_id TEXT PRIMARY KEY,
    tokens_remaining INTEGER NOT NULL DEFAULT 0 CHECK (tokens_remaining >= 0),
    auto_reload_enabled INTEGER NOT NULL DEFAULT 0,
    auto_reload_threshold INTEGER,
    auto_reload_amount INTEGER,
    max_monthly_auto_reload INTEGER,
    monthly_auto_reloaded INTEGER NOT NULL DEFAULT 0,
    auto_reload_month TEXT,
    payment_method_id TEXT,
    updated_at INTEGER NOT NULL
);
"#;

/// Durable step runtime: memoized step outputs and the follow-on event outbox.
pub const RUNTIME_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS step_results (
    function_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    step_name TEXT NOT NULL,
    seq INTEGER NOT NULL,
    output_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (function_id, run_id, step_name)
);

CREATE TABLE IF NOT EXISTS event_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    dedupe_key TEXT UNIQUE,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    delivered_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_outbox_status ON event_outbox(status, id);

CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL,
    issue_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    storage_key TEXT NOT NULL UNIQUE,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attachments_issue ON attachments(issue_id);
"#;
