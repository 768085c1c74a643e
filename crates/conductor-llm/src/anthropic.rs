//! Anthropic Messages API client.
//!
//! Non-streaming: the orchestrators only need the final text and usage.
//! The system prompt is sent as content blocks so the static segment can
//! carry a `cache_control` marker. Web search and web fetch run as
//! server-side tools capped with `max_uses`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use crate::types::{ModelClient, ModelRequest, ModelResponse, TokenUsage};
use conductor_core::{Error, Result};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const WEB_FETCH_BETA: &str = "web-fetch-2025-09-10";

pub struct AnthropicClient {
    client: Client,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
        })
    }

    fn build_body(request: &ModelRequest) -> serde_json::Value {
        let system: Vec<serde_json::Value> = request
            .system
            .iter()
            .map(|seg| {
                let mut block = json!({"type": "text", "text": seg.text});
                if seg.cache {
                    block["cache_control"] = json!({"type": "ephemeral"});
                }
                block
            })
            .collect();

        let mut tools = Vec::new();
        if request.tool_budget.web_search > 0 {
            tools.push(json!({
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": request.tool_budget.web_search,
            }));
        }
        if request.tool_budget.web_fetch > 0 {
            tools.push(json!({
                "type": "web_fetch_20250910",
                "name": "web_fetch",
                "max_uses": request.tool_budget.web_fetch,
            }));
        }

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": request.user_prompt}],
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }

    fn parse_response(parsed: MessagesResponse, requested_model: &str) -> ModelResponse {
        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        ModelResponse {
            text,
            model: if parsed.model.is_empty() {
                requested_model.to_string()
            } else {
                parsed.model
            },
            usage: TokenUsage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
                cache_creation_input_tokens: parsed.usage.cache_creation_input_tokens.unwrap_or(0),
                cache_read_input_tokens: parsed.usage.cache_read_input_tokens.unwrap_or(0),
            },
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let body = Self::build_body(request);
        debug!("Calling Anthropic with model {}", request.model);

        let mut builder = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        if request.tool_budget.web_fetch > 0 {
            builder = builder.header("anthropic-beta", WEB_FETCH_BETA);
        }

        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Anthropic API error {}: {}", status, body);
            return Err(Error::Model(format!("API error {}: {}", status, body)));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::Model(format!("Malformed response: {}", e)))?;

        Ok(Self::parse_response(parsed, &request.model))
    }
}
