//! Work item model.
//!
//! A work item is a user's mutation intent that has not been confirmed by
//! the server yet. It carries the action to run, the payload to run it
//! with, and the bookkeeping the sync engine needs to retry it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::registry::Action;

/// A queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
  pub id: WorkId,

  /// Resolved against the handler registry on every attempt.
  pub action: Action,

  pub payload: Payload,

  /// When the user performed the action. Drain order follows this.
  pub created_at: DateTime<Utc>,

  pub status: Status,

  /// Failed attempts so far. Never decreases while the item exists.
  pub retry_count: u32,

  pub last_error: Option<String>,

  /// Set by a permanent failure. Excludes the item from automatic drains.
  pub permanent: bool,

  pub updated_at: DateTime<Utc>,
}

impl WorkItem {
  /// Whether an automatic drain pass may attempt this item.
  pub fn is_eligible(&self, max_retries: u32) -> bool {
    self.status.is_pending() && !self.permanent && self.retry_count < max_retries
  }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for WorkId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Display for WorkId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl FromStr for WorkId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Uuid::parse_str(s.trim()).map(WorkId)
  }
}

/// Lifecycle state of a work item.
///
/// `Done` is never stored: completing an item deletes its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
  Queued,
  Syncing,
  Done,
  Failed,
}

impl Status {
  /// Queued and failed items are eligible for (re)processing.
  pub fn is_pending(self) -> bool {
    matches!(self, Status::Queued | Status::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Status::Queued => "queued",
      Status::Syncing => "syncing",
      Status::Done => "done",
      Status::Failed => "failed",
    }
  }
}

impl std::fmt::Display for Status {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Status {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "queued" => Ok(Status::Queued),
      "syncing" => Ok(Status::Syncing),
      "done" => Ok(Status::Done),
      "failed" => Ok(Status::Failed),
      other => Err(format!("unknown status: {other}")),
    }
  }
}

/// Structured data plus any binary attachments (e.g. recorded audio).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
  pub data: serde_json::Value,
  pub attachments: Vec<Attachment>,
}

impl Payload {
  pub fn new(data: serde_json::Value) -> Self {
    Self {
      data,
      attachments: Vec::new(),
    }
  }

  pub fn with_attachment(mut self, attachment: Attachment) -> Self {
    self.attachments.push(attachment);
    self
  }

  /// Total attachment size in bytes.
  pub fn attachment_bytes(&self) -> usize {
    self.attachments.iter().map(|a| a.bytes.len()).sum()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
  pub name: String,
  pub content_type: String,
  pub bytes: Vec<u8>,
}

impl Attachment {
  pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
    Self {
      name: name.into(),
      content_type: content_type.into(),
      bytes,
    }
  }
}

/// Builder for enqueueing work.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
  pub(crate) action: Action,
  pub(crate) payload: Payload,
  pub(crate) created_at: Option<DateTime<Utc>>,
}

impl NewWorkItem {
  pub fn new(action: Action, payload: Payload) -> Self {
    Self {
      action,
      payload,
      created_at: None,
    }
  }

  /// Record the time of the originating user action instead of "now".
  pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
    self.created_at = Some(at);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn item(status: Status, retry_count: u32, permanent: bool) -> WorkItem {
    WorkItem {
      id: WorkId::new(),
      action: Action::UpdatePhaseStatus,
      payload: Payload::new(json!({})),
      created_at: Utc::now(),
      status,
      retry_count,
      last_error: None,
      permanent,
      updated_at: Utc::now(),
    }
  }

  #[test]
  fn test_status_round_trips_through_str() {
    for status in [Status::Queued, Status::Syncing, Status::Done, Status::Failed] {
      assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
    }
    assert!("running".parse::<Status>().is_err());
  }

  #[test]
  fn test_eligibility() {
    assert!(item(Status::Queued, 0, false).is_eligible(3));
    assert!(item(Status::Failed, 2, false).is_eligible(3));
    assert!(!item(Status::Failed, 3, false).is_eligible(3));
    assert!(!item(Status::Failed, 0, true).is_eligible(3));
    assert!(!item(Status::Syncing, 0, false).is_eligible(3));
  }

  #[test]
  fn test_work_id_parses_display_output() {
    let id = WorkId::new();
    assert_eq!(id.to_string().parse::<WorkId>().unwrap(), id);
  }
}
