//! Execution engine for AI subtasks.
//!
//! `ExecutionEngine` is a pure (prompt, tool budget) -> (text, usage)
//! function over a `ModelClient`. It never retries and never touches the
//! database; recovery and persistence belong to the orchestrators.

pub mod anthropic;
pub mod engine;
pub mod mock;
pub mod types;

pub use anthropic::AnthropicClient;
pub use engine::ExecutionEngine;
pub use mock::{ScriptedModelClient, ScriptedResponse};
pub use types::*;
