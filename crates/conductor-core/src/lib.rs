//! Conductor Core: error types, configuration and data paths shared by every crate.

pub mod config;
pub mod error;

pub use config::{ConcurrencyLimits, ConductorConfig, DataPaths, ModelSettings, ToolBudget};
pub use error::{Error, Result};
