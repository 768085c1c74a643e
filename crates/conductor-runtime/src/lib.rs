//! Conductor runtime: durable execution of AI subtasks.
//!
//! Runs AI subtasks singly or as an ordered chain on top of a checkpointed
//! step runtime, tracks one job row per run, meters usage and publishes
//! results as attachments on the parent issue.

pub mod attachments;
pub mod jobs;
pub mod orchestrator;
pub mod prompt;
pub mod sequential;
pub mod services;
pub mod single;
pub mod steps;
pub mod types;

#[cfg(test)]
mod testing;

pub use attachments::{AttachmentStore, FsAttachmentStore};
pub use jobs::{JobTracker, JOB_TRACKER_FUNCTION_ID};
pub use orchestrator::Orchestrator;
pub use prompt::{PreviousTaskResult, PromptBuilder};
pub use services::{RunLimits, RunServices};
pub use steps::{RunFinished, StepContext, StepRuntime, RUN_FINISHED_EVENT};
pub use types::*;
