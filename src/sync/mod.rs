//! Sync engine: drains the durable queue through the handler registry.
//!
//! A drain pass reads every pending item in `created_at` order and
//! attempts each eligible one exactly once. A failing item never blocks
//! the items behind it. Only one pass (or manual retry) runs at a time.

mod engine;
mod report;

pub use engine::{DrainToken, ItemOutcome, StopHandle, SyncEngine, SyncPolicy};
pub use report::{DrainReport, SyncProgress, SyncStatus};
