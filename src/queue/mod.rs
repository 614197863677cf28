//! Durable queue of mutation intents awaiting sync.

mod storage;
mod types;

pub use storage::{QueueCounts, QueueStore, SqliteQueue};
pub use types::{Attachment, NewWorkItem, Payload, Status, WorkId, WorkItem};
