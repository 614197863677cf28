//! Progress and outcome types for drain passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::QueueCounts;

/// Live progress of the current drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
  /// Items removed from the queue so far in this pass
  pub synced: usize,
  /// Items attempted so far in this pass
  pub attempted: usize,
  /// Items this pass will attempt
  pub total: usize,
}

/// Summary of a finished drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  /// Eligible items at the start of the pass
  pub total: usize,
  pub synced: usize,
  /// Transient failures; retried by a later pass while under the limit
  pub failed: usize,
  /// Permanent failures; wait for manual retry or discard
  pub rejected: usize,
  /// Pending items skipped because they are exhausted or rejected
  pub skipped: usize,
  /// The pass was stopped before reaching every item
  pub abandoned: bool,
}

impl DrainReport {
  /// Items that reached a handler in this pass.
  pub fn attempted(&self) -> usize {
    self.synced + self.failed + self.rejected
  }

  pub fn is_clean(&self) -> bool {
    self.failed == 0 && self.rejected == 0 && !self.abandoned
  }

  /// User-facing one-line summary.
  pub fn summary(&self) -> String {
    let mut line = format!("synced {}/{}", self.synced, self.total);
    let unsynced = self.failed + self.rejected;
    if unsynced > 0 {
      line.push_str(&format!(", {unsynced} items failed to sync"));
    }
    if self.abandoned {
      line.push_str(" (stopped early)");
    }
    line
  }
}

/// Snapshot for status badges. Reading it never triggers a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
  pub counts: QueueCounts,
  pub last_drain: Option<DrainReport>,
  pub draining: bool,
}
