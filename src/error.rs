//! Typed errors for the queue, handlers, and capture sessions.
//!
//! Application plumbing (config, CLI, HTTP setup) reports through
//! `color_eyre`; these enums exist where callers branch on the kind.

use std::time::Duration;

use thiserror::Error;

use crate::queue::{Status, WorkId};

/// Failure of a durable queue operation. Always surfaced to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("storage error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to encode payload: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("work item not found: {0}")]
  NotFound(WorkId),

  #[error("invalid transition for {id}: {from} -> {to}")]
  InvalidTransition { id: WorkId, from: Status, to: Status },

  #[error("queue is full ({limit} items)")]
  QuotaExceeded { limit: usize },

  #[error("queue lock poisoned")]
  LockPoisoned,

  #[error("corrupt row: {0}")]
  Corrupt(String),
}

/// Outcome of a failed handler invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
  /// Network dropped, server error, or anything else worth retrying.
  #[error("{0}")]
  Transient(String),

  /// The server rejected the input, or nothing can execute the action.
  #[error("rejected: {0}")]
  Permanent(String),

  #[error("timed out after {0:?}")]
  Timeout(Duration),
}

impl HandlerError {
  pub fn is_permanent(&self) -> bool {
    matches!(self, HandlerError::Permanent(_))
  }
}

/// Capture-session failures.
#[derive(Debug, Error)]
pub enum CaptureError {
  #[error("recording failed to start: {0}")]
  Start(String),

  #[error("audio source error: {0}")]
  Source(String),

  #[error("recording cancelled")]
  Cancelled,

  #[error("recording too large for a WAV file: {0}")]
  TooLarge(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
