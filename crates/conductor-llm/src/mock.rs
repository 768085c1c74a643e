use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::{ModelClient, ModelRequest, ModelResponse, TokenUsage};
use conductor_core::{Error, Result};

/// Pre-programmed model outcome for deterministic runs without API calls.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Text { text: String, usage: TokenUsage },
    Error(String),
}

impl ScriptedResponse {
    /// Text response with a small fixed usage.
    pub fn text(text: &str) -> Self {
        Self::Text {
            text: text.to_string(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
            },
        }
    }

    pub fn text_with_usage(text: &str, usage: TokenUsage) -> Self {
        Self::Text {
            text: text.to_string(),
            usage,
        }
    }

    pub fn error(message: &str) -> Self {
        Self::Error(message.to_string())
    }
}

/// Model client that replays scripted responses in order and records every
/// request it receives.
pub struct ScriptedModelClient {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    fallback: Option<ScriptedResponse>,
    requests: Mutex<Vec<ModelRequest>>,
    call_count: AtomicUsize,
}

impl ScriptedModelClient {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Response used once the script is exhausted.
    pub fn with_fallback(mut self, fallback: ScriptedResponse) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let next = self.responses.lock().pop_front();
        let response = match next.or_else(|| self.fallback.clone()) {
            Some(r) => r,
            None => {
                return Err(Error::Model(format!(
                    "ScriptedModelClient: no response configured for call {}",
                    idx
                )))
            }
        };

        match response {
            ScriptedResponse::Text { text, usage } => Ok(ModelResponse {
                text,
                model: request.model.clone(),
                usage,
            }),
            ScriptedResponse::Error(message) => Err(Error::Model(message)),
        }
    }
}
