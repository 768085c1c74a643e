//! Configuration and data directory management.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 3010;
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Characters kept from a completed subtask's output when it is handed to later subtasks.
pub const DEFAULT_DIGEST_CHARS: usize = 1500;
/// Characters kept in a subtask's stored execution summary.
pub const DEFAULT_SUMMARY_CHARS: usize = 500;

/// Paths to all Conductor data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// SQLite database directory (`data/db/`).
    pub db: PathBuf,
    /// Attachment blobs (`data/attachments/`).
    pub attachments: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            attachments: root.join("attachments"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.db)?;
        std::fs::create_dir_all(&self.attachments)?;
        Ok(())
    }
}

/// Per-call tool budget handed to the model. Bounds agentic loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBudget {
    #[serde(rename = "webSearch")]
    pub web_search: u32,
    #[serde(rename = "webFetch")]
    pub web_fetch: u32,
}

impl Default for ToolBudget {
    fn default() -> Self {
        Self {
            web_search: 5,
            web_fetch: 3,
        }
    }
}

/// Model selection and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub tool_budget: ToolBudget,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            api_key: None,
            tool_budget: ToolBudget::default(),
        }
    }
}

/// Concurrency ceiling per orchestration function kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    pub single_task: usize,
    pub sequential: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            single_task: 5,
            sequential: 3,
        }
    }
}

/// Top-level Conductor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// HTTP server port.
    pub port: u16,
    /// Data directory paths.
    pub data_paths: DataPaths,
    pub model: ModelSettings,
    pub concurrency: ConcurrencyLimits,
    /// Attempts per run before the failure hook fires.
    pub max_attempts: u32,
    pub digest_chars: usize,
    pub summary_chars: usize,
}

impl ConductorConfig {
    /// Defaults rooted at `data_dir`, ignoring the environment.
    pub fn with_defaults(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            port: DEFAULT_PORT,
            data_paths: DataPaths::new(data_dir)?,
            model: ModelSettings::default(),
            concurrency: ConcurrencyLimits::default(),
            max_attempts: 3,
            digest_chars: DEFAULT_DIGEST_CHARS,
            summary_chars: DEFAULT_SUMMARY_CHARS,
        })
    }

    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut config = Self::with_defaults(data_dir)?;

        config.port = env_or("PORT", config.port);
        config.model.model =
            std::env::var("CONDUCTOR_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into());
        config.model.max_tokens = env_or("CONDUCTOR_MAX_TOKENS", config.model.max_tokens);
        config.model.api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        config.concurrency.single_task =
            env_or("CONDUCTOR_SINGLE_CONCURRENCY", config.concurrency.single_task).max(1);
        config.concurrency.sequential =
            env_or("CONDUCTOR_SEQUENTIAL_CONCURRENCY", config.concurrency.sequential).max(1);
        config.max_attempts = env_or("CONDUCTOR_MAX_ATTEMPTS", config.max_attempts).max(1);

        if config.model.api_key.is_none() {
            tracing::warn!("ANTHROPIC_API_KEY not set; model calls will fail");
        }

        Ok(config)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_paths_created() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        assert!(paths.db.is_dir());
        assert!(paths.attachments.is_dir());
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConductorConfig::with_defaults(dir.path()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.concurrency.single_task, 5);
        assert_eq!(config.concurrency.sequential, 3);
        assert_eq!(config.model.tool_budget, ToolBudget { web_search: 5, web_fetch: 3 });
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_api_key_not_serialized() {
        let settings = ModelSettings {
            api_key: Some("sk-secret".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
