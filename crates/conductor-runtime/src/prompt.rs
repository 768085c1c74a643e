//! Prompt builder.
//!
//! The static part depends only on the workspace and is sent as the cached
//! system segment. Everything that varies per call goes in the dynamic part.

use conductor_llm::PromptParts;
use conductor_store::{Issue, Workspace};

use crate::types::TaskOutcome;

const DEFAULT_PERSONA: &str =
    "You are a diligent marketing operations assistant working on behalf of this workspace.";

const NO_BRAND_SUMMARY: &str = "No brand summary is on file for this workspace.";

const NO_PARENT_CONTEXT: &str = "No parent context available. Treat this subtask as standalone.";

const TOOL_INSTRUCTIONS: &str = "\
You may search the web and fetch pages when the task needs current or external facts. \
Tool calls are limited, so search with intent and stop once you have enough to answer.";

const OUTPUT_INSTRUCTIONS: &str = "\
Reply with the finished deliverable in Markdown. Start with a one-paragraph summary, \
then the full result. Do not describe your process or ask follow-up questions.";

/// Digest of a completed chain subtask. The summary is truncated when the
/// value is constructed, so rendering never has to.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviousTaskResult {
    pub identifier: String,
    pub title: String,
    pub summary: String,
}

impl PreviousTaskResult {
    pub fn new(identifier: &str, title: &str, output: &str, budget: usize) -> Self {
        Self {
            identifier: identifier.to_string(),
            title: title.to_string(),
            summary: truncate_chars(output, budget),
        }
    }

    /// Digests of the completed outcomes, in chain order. Failed outcomes
    /// contribute nothing.
    pub fn fold(outcomes: &[TaskOutcome], budget: usize) -> Vec<Self> {
        outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                TaskOutcome::Succeeded {
                    identifier,
                    title,
                    output,
                    ..
                } => Some(Self::new(identifier, title, output, budget)),
                TaskOutcome::Failed { .. } => None,
            })
            .collect()
    }
}

/// Cut `text` to at most `budget` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, budget: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= budget {
        return text.to_string();
    }
    if budget == 0 {
        return String::new();
    }
    let mut cut: String = text.chars().take(budget - 1).collect();
    cut.truncate(cut.trim_end().len());
    cut.push('…');
    cut
}

pub struct PromptBuilder;

impl PromptBuilder {
    pub fn build(
        workspace: &Workspace,
        parent: Option<&Issue>,
        subtask: &Issue,
        previous: &[PreviousTaskResult],
    ) -> PromptParts {
        PromptParts {
            static_part: Self::static_part(workspace),
            dynamic_part: Self::dynamic_part(parent, subtask, previous),
        }
    }

    /// Workspace persona, brand summary and fixed instructions.
    pub fn static_part(workspace: &Workspace) -> String {
        let persona = non_empty(workspace.persona.as_deref()).unwrap_or(DEFAULT_PERSONA);
        let brand = non_empty(workspace.brand_summary.as_deref()).unwrap_or(NO_BRAND_SUMMARY);

        let mut out = String::new();
        out.push_str(&format!("# Workspace: {}\n\n", workspace.name));
        out.push_str("## Persona\n");
        out.push_str(persona);
        out.push_str("\n\n## Brand Summary\n");
        out.push_str(brand);
        out.push_str("\n\n## Tools\n");
        out.push_str(TOOL_INSTRUCTIONS);
        out.push_str("\n\n## Output\n");
        out.push_str(OUTPUT_INSTRUCTIONS);
        out.push('\n');
        out
    }

    pub fn dynamic_part(
        parent: Option<&Issue>,
        subtask: &Issue,
        previous: &[PreviousTaskResult],
    ) -> String {
        let mut out = String::new();

        out.push_str("# Parent Issue\n");
        match parent {
            Some(p) => {
                out.push_str(&format!("{}: {}\n", p.identifier, p.title));
                if let Some(desc) = non_empty(p.description.as_deref()) {
                    out.push('\n');
                    out.push_str(desc);
                    out.push('\n');
                }
            }
            None => {
                out.push_str(NO_PARENT_CONTEXT);
                out.push('\n');
            }
        }

        out.push_str("\n# Your Subtask\n");
        out.push_str(&format!("{}: {}\n", subtask.identifier, subtask.title));
        if let Some(desc) = non_empty(subtask.description.as_deref()) {
            out.push('\n');
            out.push_str(desc);
            out.push('\n');
        }
        if let Some(instructions) = non_empty(subtask.ai_instructions.as_deref()) {
            out.push_str("\n## Special Instructions\n");
            out.push_str(instructions);
            out.push('\n');
        }

        if !previous.is_empty() {
            out.push_str("\n# Completed Prior Subtasks\n");
            out.push_str(
                "These subtasks in the same chain are already done. Build on them; do not redo them.\n",
            );
            for (i, prior) in previous.iter().enumerate() {
                out.push_str(&format!(
                    "\n## {}. {}: {}\n{}\n",
                    i + 1,
                    prior.identifier,
                    prior.title,
                    prior.summary
                ));
            }
        }

        out
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
