//! Row types for workspaces, issues, jobs, usage and balances.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A workspace row. Persona and brand feed the cached prompt segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand_summary: Option<String>,
    pub created_at: i64,
}

/// AI execution state of a subtask. `None` on the row means never scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl AiExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for AiExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AiExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown ai execution status: {}", other)),
        }
    }
}

/// An issue row. Subtasks are issues with a `parent_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub workspace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Human identifier shown on the board, e.g. `MKT-42`.
    pub identifier: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_instructions: Option<String>,
    pub ai_assignable: bool,
    pub ai_execution_status: Option<AiExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_execution_result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_execution_summary: Option<String>,
    pub position: i64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// Options for inserting an issue.
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub id: String,
    pub workspace_id: String,
    pub parent_id: Option<String>,
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
    pub ai_instructions: Option<String>,
    pub ai_assignable: bool,
    pub position: i64,
}

/// Job tracker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// A job tracker row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub workspace_id: String,
    pub function_id: String,
    pub run_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: i64,
}

/// Options for creating a job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub workspace_id: String,
    pub function_id: String,
    pub run_id: String,
    pub metadata: Option<serde_json::Value>,
    pub max_attempts: u32,
}

/// A usage ledger row to append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub workspace_id: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub total_tokens: i64,
    pub cost_cents: i64,
    pub source: String,
}

/// A persisted usage ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRow {
    pub id: i64,
    #[serde(flatten)]
    pub entry: UsageEntry,
    pub created_at: i64,
}

/// Aggregated usage for a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub entries: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub total_tokens: i64,
    pub cost_cents: i64,
}

/// Prepaid token balance and auto-reload settings for an owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub owner_id: String,
    pub tokens_remaining: i64,
    pub auto_reload_enabled: bool,
    pub auto_reload_threshold: Option<i64>,
    pub auto_reload_amount: Option<i64>,
    pub max_monthly_auto_reload: Option<i64>,
    /// Tokens auto-reloaded during `auto_reload_month`.
    pub monthly_auto_reloaded: i64,
    /// Calendar month (`YYYY-MM`, UTC) that `monthly_auto_reloaded` counts.
    pub auto_reload_month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method_id: Option<String>,
}

impl Subscription {
    /// A subscription with a balance and auto-reload disabled.
    pub fn new(owner_id: impl Into<String>, tokens_remaining: i64) -> Self {
        Self {
            owner_id: owner_id.into(),
            tokens_remaining,
            auto_reload_enabled: false,
            auto_reload_threshold: None,
            auto_reload_amount: None,
            max_monthly_auto_reload: None,
            monthly_auto_reloaded: 0,
            auto_reload_month: None,
            payment_method_id: None,
        }
    }

    /// Tokens auto-reloaded in `month`. A stale month counts as zero.
    pub fn reloaded_in_month(&self, month: &str) -> i64 {
        match &self.auto_reload_month {
            Some(m) if m == month => self.monthly_auto_reloaded,
            _ => 0,
        }
    }

    pub fn has_payment_method(&self) -> bool {
        self.payment_method_id
            .as_deref()
            .is_some_and(|p| !p.is_empty())
    }
}

/// Balance after deducting `deduction` tokens, floored at zero.
pub fn floored_balance(balance: i64, deduction: i64) -> i64 {
    balance.saturating_sub(deduction).max(0)
}

/// Result of appending a ledger row and decrementing the owner's balance.
#[derive(Debug, Clone)]
pub struct UsageRecording {
    /// False when the idempotency key was already recorded; nothing changed.
    pub inserted: bool,
    pub balance_before: Option<i64>,
    /// Subscription state after the decrement (None if the owner has none).
    pub subscription: Option<Subscription>,
}

/// Outbox delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Dead => "dead",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown outbox status: {}", other)),
        }
    }
}

/// A queued follow-on event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub id: i64,
    pub name: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub status: OutboxStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// Index row for a stored attachment blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRecord {
    pub workspace_id: String,
    pub issue_id: String,
    pub filename: String,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub content_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floored_balance() {
        assert_eq!(floored_balance(1000, 250), 750);
        assert_eq!(floored_balance(100, 250), 0);
        assert_eq!(floored_balance(0, 0), 0);
        assert_eq!(floored_balance(i64::MIN + 1, i64::MAX), 0);
    }

    #[test]
    fn test_reloaded_in_month_resets_on_new_month() {
        let mut sub = Subscription::new("owner-1", 0);
        sub.monthly_auto_reloaded = 40_000;
        sub.auto_reload_month = Some("2026-09".into());
        assert_eq!(sub.reloaded_in_month("2026-09"), 40_000);
        assert_eq!(sub.reloaded_in_month("2026-10"), 0);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<AiExecutionStatus>().is_err());
    }

    #[test]
    fn test_empty_payment_method_is_absent() {
        let mut sub = Subscription::new("o", 10);
        assert!(!sub.has_payment_method());
        sub.payment_method_id = Some(String::new());
        assert!(!sub.has_payment_method());
        sub.payment_method_id = Some("pm_123".into());
        assert!(sub.has_payment_method());
    }
}
