//! Request/response types for model calls.

use async_trait::async_trait;
use conductor_core::{Result, ToolBudget};
use serde::{Deserialize, Serialize};

/// A system prompt segment. `cache` asks the provider to cache the prefix
/// ending at this segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSegment {
    pub text: String,
    pub cache: bool,
}

/// Assembled prompt: static part first (cached), dynamic part per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParts {
    pub static_part: String,
    pub dynamic_part: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Vec<SystemSegment>,
    pub user_prompt: String,
    pub tool_budget: ToolBudget,
}

/// Token usage split the way the provider reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Tokens charged against a prepaid balance: input plus output.
    /// Cache reads and writes are reported but not deducted.
    pub fn billable_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// A language-model backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;
}
