//! Execution engine: one bounded model call per invocation.

use std::sync::Arc;

use tracing::debug;

use crate::types::{ModelClient, ModelRequest, ModelResponse, PromptParts, SystemSegment};
use conductor_core::{ModelSettings, Result};

#[derive(Clone)]
pub struct ExecutionEngine {
    client: Arc<dyn ModelClient>,
    settings: ModelSettings,
}

impl ExecutionEngine {
    pub fn new(client: Arc<dyn ModelClient>, settings: ModelSettings) -> Self {
        Self { client, settings }
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// Build the provider request: the static part is the only system
    /// segment and is marked cacheable; the dynamic part is the user turn.
    pub fn build_request(&self, prompt: &PromptParts) -> ModelRequest {
        ModelRequest {
            model: self.settings.model.clone(),
            max_tokens: self.settings.max_tokens,
            system: vec![SystemSegment {
                text: prompt.static_part.clone(),
                cache: true,
            }],
            user_prompt: prompt.dynamic_part.clone(),
            tool_budget: self.settings.tool_budget,
        }
    }

    /// Run the prompt. Errors from the client are returned as-is.
    pub async fn execute(&self, prompt: &PromptParts) -> Result<ModelResponse> {
        let request = self.build_request(prompt);
        let response = self.client.complete(&request).await?;
        debug!(
            client = self.client.name(),
            input = response.usage.input_tokens,
            output = response.usage.output_tokens,
            cache_read = response.usage.cache_read_input_tokens,
            "Model call finished"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedModelClient, ScriptedResponse};
    use conductor_core::{Error, ToolBudget};

    fn prompt() -> PromptParts {
        PromptParts {
            static_part: "persona".into(),
            dynamic_part: "do the thing".into(),
        }
    }

    #[tokio::test]
    async fn test_execute_passes_budget_and_cache_hint() {
        let client = Arc::new(ScriptedModelClient::new(vec![ScriptedResponse::text("ok")]));
        let settings = ModelSettings {
            model: "claude-test".into(),
            tool_budget: ToolBudget {
                web_search: 2,
                web_fetch: 1,
            },
            ..Default::default()
        };
        let engine = ExecutionEngine::new(client.clone(), settings);

        let response = engine.execute(&prompt()).await.unwrap();
        assert_eq!(response.text, "ok");

        let sent = &client.requests()[0];
        assert_eq!(sent.model, "claude-test");
        assert_eq!(sent.system.len(), 1);
        assert!(sent.system[0].cache);
        assert_eq!(sent.system[0].text, "persona");
        assert_eq!(sent.user_prompt, "do the thing");
        assert_eq!(sent.tool_budget.web_search, 2);
    }

    #[tokio::test]
    async fn test_errors_propagate_unmodified() {
        let client = Arc::new(ScriptedModelClient::new(vec![ScriptedResponse::error(
            "rate limited",
        )]));
        let engine = ExecutionEngine::new(client.clone(), ModelSettings::default());
        let err = engine.execute(&prompt()).await.unwrap_err();
        assert!(matches!(err, Error::Model(ref m) if m == "rate limited"));
        assert_eq!(client.call_count(), 1);
    }
}
