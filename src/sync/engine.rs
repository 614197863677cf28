use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::report::{DrainReport, SyncProgress, SyncStatus};
use crate::config::SyncConfig;
use crate::error::{HandlerError, StoreError, StoreResult};
use crate::queue::{Payload, QueueStore, WorkId, WorkItem};
use crate::registry::{Action, Registry};

const LAST_DRAIN_KEY: &str = "last_drain";

/// Slack on top of the handler timeout before a `syncing` claim counts as
/// abandoned by its owner.
const RECOVERY_GRACE: Duration = Duration::from_secs(5);

/// Retry and timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
  pub max_retries: u32,
  pub handler_timeout: Duration,
}

impl Default for SyncPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      handler_timeout: Duration::from_secs(30),
    }
  }
}

impl From<&SyncConfig> for SyncPolicy {
  fn from(config: &SyncConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      handler_timeout: config.handler_timeout(),
    }
  }
}

/// What happened to one item in one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
  /// Handler succeeded; the item is gone.
  Synced,
  /// Transient failure. `retry_count` is the new count.
  Failed { retry_count: u32, error: String },
  /// Permanent failure; excluded from automatic drains.
  Rejected { error: String },
}

/// Requests that running passes stop before their next item.
///
/// Stopping bumps a generation counter. A pass stops once the counter
/// moves past the [`DrainToken`] it was started with, so a stop issued
/// after a pass is requested but before it runs still applies to it.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicU64>);

impl StopHandle {
  pub fn stop(&self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }
}

/// Stop generation observed when a pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainToken(u64);

/// Clears the in-flight flag when the pass ends, even if it is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Drains the queue through the handler registry.
pub struct SyncEngine<S: QueueStore> {
  store: Arc<S>,
  registry: Arc<Registry>,
  policy: SyncPolicy,
  in_flight: AtomicBool,
  stop: Arc<AtomicU64>,
  progress: watch::Sender<SyncProgress>,
}

impl<S: QueueStore> SyncEngine<S> {
  pub fn new(store: Arc<S>, registry: Arc<Registry>, policy: SyncPolicy) -> Self {
    let (progress, _) = watch::channel(SyncProgress::default());
    Self {
      store,
      registry,
      policy,
      in_flight: AtomicBool::new(false),
      stop: Arc::new(AtomicU64::new(0)),
      progress,
    }
  }

  pub fn policy(&self) -> SyncPolicy {
    self.policy
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  /// Live progress of drain passes.
  pub fn progress(&self) -> watch::Receiver<SyncProgress> {
    self.progress.subscribe()
  }

  pub fn stop_handle(&self) -> StopHandle {
    StopHandle(Arc::clone(&self.stop))
  }

  /// Token for a pass that should honor every stop issued from now on.
  pub fn token(&self) -> DrainToken {
    DrainToken(self.stop.load(Ordering::SeqCst))
  }

  fn stopped_since(&self, token: DrainToken) -> bool {
    self.stop.load(Ordering::SeqCst) != token.0
  }

  pub fn is_draining(&self) -> bool {
    self.in_flight.load(Ordering::SeqCst)
  }

  fn begin(&self) -> Option<InFlight<'_>> {
    if self.in_flight.swap(true, Ordering::SeqCst) {
      return None;
    }
    Some(InFlight(&self.in_flight))
  }

  /// Return items stranded in `syncing` by a crashed dispatcher to the
  /// queue.
  ///
  /// Only claims older than the handler timeout plus a grace period are
  /// touched: a live dispatcher in another process settles or times out
  /// well within that window.
  pub fn recover(&self) -> StoreResult<usize> {
    let window = self.policy.handler_timeout + RECOVERY_GRACE;
    let cutoff = chrono::Duration::from_std(window)
      .ok()
      .and_then(|window| Utc::now().checked_sub_signed(window));
    match cutoff {
      Some(cutoff) => self.store.recover_interrupted(cutoff),
      None => Ok(0),
    }
  }

  /// Run one drain pass.
  ///
  /// Returns `None` without touching the queue if another pass or a
  /// manual retry is already running.
  pub async fn drain(&self) -> StoreResult<Option<DrainReport>> {
    self.drain_with(self.token()).await
  }

  /// Run one drain pass that stops once a stop is issued after `token`
  /// was taken.
  pub async fn drain_with(&self, token: DrainToken) -> StoreResult<Option<DrainReport>> {
    let Some(_guard) = self.begin() else {
      debug!("drain already in flight, skipping");
      return Ok(None);
    };

    // none of this process's items can be syncing while the guard is held
    self.recover()?;

    let started_at = Utc::now();
    let pending = self.store.list_pending()?;
    let (eligible, skipped): (Vec<WorkItem>, Vec<WorkItem>) = pending
      .into_iter()
      .partition(|item| item.is_eligible(self.policy.max_retries));

    let mut report = DrainReport {
      started_at,
      finished_at: started_at,
      total: eligible.len(),
      skipped: skipped.len(),
      ..Default::default()
    };
    info!(
      total = report.total,
      skipped = report.skipped,
      "drain pass started"
    );

    let mut progress = SyncProgress {
      total: report.total,
      ..Default::default()
    };
    self.progress.send_replace(progress);

    for item in eligible {
      if self.stopped_since(token) {
        info!("drain pass stopped between items");
        report.abandoned = true;
        break;
      }

      match self.attempt(&item).await {
        Ok(ItemOutcome::Synced) => report.synced += 1,
        Ok(ItemOutcome::Failed { .. }) => report.failed += 1,
        Ok(ItemOutcome::Rejected { .. }) => report.rejected += 1,
        // Discarded or claimed since the pending scan; the rest can still go.
        Err(StoreError::NotFound(id)) | Err(StoreError::InvalidTransition { id, .. }) => {
          warn!(%id, "work item changed during drain, skipping");
          report.skipped += 1;
        }
        Err(e) => return Err(e),
      }

      progress.attempted += 1;
      progress.synced = report.synced;
      self.progress.send_replace(progress);
    }

    report.finished_at = Utc::now();
    self.record(&report);
    info!(
      synced = report.synced,
      failed = report.failed,
      rejected = report.rejected,
      "drain pass finished"
    );
    Ok(Some(report))
  }

  /// Attempt one item on explicit user request.
  ///
  /// Bypasses the retry limit and the permanent flag. Returns `None` if a
  /// drain pass is running.
  pub async fn retry_item(&self, id: WorkId) -> StoreResult<Option<ItemOutcome>> {
    let Some(_guard) = self.begin() else {
      return Ok(None);
    };

    self.store.clear_permanent(id)?;
    let item = self.store.get(id)?;
    info!(%id, action = %item.action, retry_count = item.retry_count, "manual retry");
    self.attempt(&item).await.map(Some)
  }

  /// Delete an item on explicit user request.
  pub fn discard(&self, id: WorkId) -> StoreResult<()> {
    self.store.discard(id)
  }

  /// Run a handler directly, bypassing the queue.
  pub async fn execute(&self, action: &Action, payload: &Payload) -> Result<(), HandlerError> {
    let Some(handler) = self.registry.resolve(action) else {
      return Err(HandlerError::Permanent(format!(
        "no handler registered for action {action}"
      )));
    };

    match tokio::time::timeout(self.policy.handler_timeout, handler.execute(payload)).await {
      Ok(result) => result,
      Err(_) => Err(HandlerError::Timeout(self.policy.handler_timeout)),
    }
  }

  async fn attempt(&self, item: &WorkItem) -> StoreResult<ItemOutcome> {
    self.store.mark_syncing(item.id)?;

    match self.execute(&item.action, &item.payload).await {
      Ok(()) => {
        self.store.mark_done(item.id)?;
        info!(id = %item.id, action = %item.action, "work item synced");
        Ok(ItemOutcome::Synced)
      }
      Err(e) if e.is_permanent() => {
        let error = e.to_string();
        self.store.mark_rejected(item.id, &error)?;
        warn!(id = %item.id, action = %item.action, %error, "work item rejected");
        Ok(ItemOutcome::Rejected { error })
      }
      Err(e) => {
        let error = e.to_string();
        let retry_count = self.store.mark_failed(item.id, &error)?;
        warn!(
          id = %item.id,
          action = %item.action,
          retry_count,
          max_retries = self.policy.max_retries,
          %error,
          "work item failed"
        );
        Ok(ItemOutcome::Failed { retry_count, error })
      }
    }
  }

  fn record(&self, report: &DrainReport) {
    // an empty pass has no outcome worth replacing the last one with
    if report.attempted() == 0 {
      return;
    }
    let saved = serde_json::to_string(report)
      .map_err(StoreError::from)
      .and_then(|json| self.store.set_meta(LAST_DRAIN_KEY, &json));
    if let Err(e) = saved {
      error!("failed to record drain outcome: {e}");
    }
  }

  /// Current queue counts and last outcome, without draining.
  pub fn status(&self) -> StoreResult<SyncStatus> {
    let counts = self.store.counts(self.policy.max_retries)?;
    let last_drain = match self.store.get_meta(LAST_DRAIN_KEY)? {
      Some(json) => serde_json::from_str(&json).ok(),
      None => None,
    };
    Ok(SyncStatus {
      counts,
      last_drain,
      draining: self.is_draining(),
    })
  }
}
