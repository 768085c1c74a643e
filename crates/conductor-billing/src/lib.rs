//! Conductor Billing: prices model usage, meters it against prepaid
//! balances and raises auto-reload requests.
//!
//! Metering never charges a card. When a balance drops under its reload
//! threshold the meter returns a `ReloadRequest`; the caller queues it as
//! an `AUTO_RELOAD_EVENT` and the billing collaborator consumes it later
//! on its own schedule.

pub mod meter;
pub mod pricing;
pub mod reload;

pub use meter::{MeterOutcome, TrackUsage, UsageMeter};
pub use pricing::{cost_cents, price_for, ModelPrice, DEFAULT_PRICE};
pub use reload::{
    evaluate_auto_reload, AutoReloadProcessor, DisabledGateway, PaymentGateway, ReloadOutcome,
    ReloadRequest, AUTO_RELOAD_EVENT,
};

/// Calendar month used to scope monthly reload totals (`YYYY-MM`, UTC).
pub fn current_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}
