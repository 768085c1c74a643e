//! Conductor Store: SQLite persistence for orchestration state.
//!
//! Holds the issue rows the orchestrators drive, the job tracker table,
//! the append-only usage ledger, prepaid balances, memoized step results
//! and the event outbox.

pub mod schema;
pub mod sqlite;
pub mod types;

pub use sqlite::SqliteStore;
pub use types::*;
