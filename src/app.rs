//! Explicit wiring of store, registry, monitor, and engine.
//!
//! Nothing here is global: the queue is opened once, handed to the engine,
//! and dropped with the `App`.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::Recording;
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::network::{NetworkMonitor, Transition};
use crate::queue::{NewWorkItem, QueueStore, SqliteQueue, WorkId};
use crate::registry::{Handler, Registry};
use crate::remote::RemoteClient;
use crate::sync::{DrainReport, SyncEngine, SyncPolicy};

/// What happened to a submitted action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
  /// Executed against the server; never queued
  Sent,
  /// Stored for a later drain
  Queued(WorkId),
}

pub struct App {
  config: Config,
  engine: Arc<SyncEngine<SqliteQueue>>,
  monitor: NetworkMonitor,
}

impl App {
  /// Open the queue under the data directory and register a remote
  /// handler for every known action.
  pub fn new(config: Config, monitor: NetworkMonitor) -> Result<Self> {
    let path = config.data_dir()?.join("queue.db");
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }
    let store = SqliteQueue::open(&path)
      .map_err(|e| eyre!("Failed to open queue at {}: {}", path.display(), e))?
      .with_max_items(config.store.max_items);

    let remote = RemoteClient::new(&config)?;
    let registry =
      Registry::with_known(|action| -> Arc<dyn Handler> { Arc::new(remote.handler(action)) });

    Ok(Self::with_parts(config, Arc::new(store), registry, monitor))
  }

  pub fn with_parts(
    config: Config,
    store: Arc<SqliteQueue>,
    registry: Registry,
    monitor: NetworkMonitor,
  ) -> Self {
    let policy = SyncPolicy::from(&config.sync);
    let engine = Arc::new(SyncEngine::new(store, Arc::new(registry), policy));
    Self {
      config,
      engine,
      monitor,
    }
  }

  pub fn engine(&self) -> &Arc<SyncEngine<SqliteQueue>> {
    &self.engine
  }

  pub fn monitor(&self) -> &NetworkMonitor {
    &self.monitor
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Run an action now if possible, otherwise queue it.
  ///
  /// Online, the handler runs directly under the timeout. A transient
  /// failure queues the action; a permanent rejection is returned and
  /// nothing is queued. Offline, the action is queued without a network
  /// attempt.
  pub async fn submit(&self, new: NewWorkItem) -> Result<Submitted> {
    if self.monitor.is_online() {
      match self.engine.execute(&new.action, &new.payload).await {
        Ok(()) => {
          info!(action = %new.action, "action sent directly");
          return Ok(Submitted::Sent);
        }
        Err(e) if e.is_permanent() => {
          return Err(eyre!("{} was rejected: {}", new.action, e));
        }
        Err(e) => {
          warn!(action = %new.action, "direct call failed, queueing: {e}");
        }
      }
    }

    let id = self.engine.store().enqueue(new)?;
    Ok(Submitted::Queued(id))
  }

  /// Hand a finished recording to the submit path.
  pub async fn submit_recording(&self, recording: Recording) -> Result<Submitted> {
    self.submit(recording.into_work_item()).await
  }

  /// Keep the queue drained until `Shutdown`.
  ///
  /// Drains on startup when items are pending, on every online edge, and
  /// on `SyncNow`. At most one pass runs at a time: a request while one is
  /// running is covered by it, and a pass cut short by an offline edge is
  /// followed by a fresh one once back online. A pass that leaves
  /// retryable failures schedules another one after an exponential delay.
  pub async fn watch(&self, mut events: EventHandler) -> Result<()> {
    let tx = events.sender();
    let stop = self.engine.stop_handle();
    let mut retry: Option<JoinHandle<()>> = None;
    let mut attempt = 0u32;
    let mut in_flight = false;

    self.engine.recover()?;
    if self.monitor.is_online() && self.retryable() > 0 {
      self.request_drain(&tx, &mut in_flight);
    }

    while let Some(event) = events.next().await {
      debug!(?event, "event");
      match event {
        Event::Network(Transition::Online) => {
          attempt = 0;
          cancel_retry(&mut retry);
          if self.retryable() > 0 {
            self.request_drain(&tx, &mut in_flight);
          }
        }
        Event::Network(Transition::Offline) => {
          // later items would only burn retries
          cancel_retry(&mut retry);
          stop.stop();
        }
        Event::SyncNow => {
          if self.monitor.is_online() {
            self.request_drain(&tx, &mut in_flight);
          }
        }
        Event::Drained(report) => {
          in_flight = false;
          if report.attempted() > 0 || report.abandoned {
            println!("{}", report.summary());
          }
          if report.abandoned {
            // stopped by an offline edge; pick up the rest once back
            if self.monitor.is_online() {
              self.request_drain(&tx, &mut in_flight);
            }
          } else if self.needs_retry(&report) {
            attempt += 1;
            let delay = self.config.sync.backoff(attempt);
            info!(attempt, ?delay, "scheduling follow-up drain");
            cancel_retry(&mut retry);
            retry = Some(schedule(&tx, delay));
          } else if report.is_clean() {
            attempt = 0;
          }
        }
        Event::DrainSkipped => in_flight = false,
        Event::DrainFailed(msg) => {
          in_flight = false;
          error!("drain failed: {msg}");
        }
        Event::Shutdown => {
          info!("shutting down");
          stop.stop();
          cancel_retry(&mut retry);
          break;
        }
      }
    }

    Ok(())
  }

  fn needs_retry(&self, report: &DrainReport) -> bool {
    report.failed > 0 && self.monitor.is_online() && self.retryable() > 0
  }

  /// Retryable count for scheduling decisions. A failed read is logged and
  /// counts as nothing to do; the next edge or `SyncNow` asks again.
  fn retryable(&self) -> usize {
    match self.engine.status() {
      Ok(status) => status.counts.retryable,
      Err(e) => {
        error!("failed to read queue status: {e}");
        0
      }
    }
  }

  fn request_drain(&self, tx: &mpsc::UnboundedSender<Event>, in_flight: &mut bool) {
    if *in_flight {
      debug!("drain already requested, not starting another");
      return;
    }
    *in_flight = true;
    self.spawn_drain(tx);
  }

  fn spawn_drain(&self, tx: &mpsc::UnboundedSender<Event>) {
    let engine = Arc::clone(&self.engine);
    let tx = tx.clone();
    // taken now so a stop handled before the task runs still applies
    let token = engine.token();
    tokio::spawn(async move {
      let event = match engine.drain_with(token).await {
        Ok(Some(report)) => Event::Drained(report),
        Ok(None) => Event::DrainSkipped,
        Err(e) => Event::DrainFailed(e.to_string()),
      };
      let _ = tx.send(event);
    });
  }
}

fn schedule(tx: &mpsc::UnboundedSender<Event>, delay: Duration) -> JoinHandle<()> {
  let tx = tx.clone();
  tokio::spawn(async move {
    tokio::time::sleep(delay).await;
    let _ = tx.send(Event::SyncNow);
  })
}

fn cancel_retry(retry: &mut Option<JoinHandle<()>>) {
  if let Some(handle) = retry.take() {
    handle.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::HandlerError;
  use crate::queue::Payload;
  use crate::registry::{handler_fn, Action};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::Notify;
  use tokio::time::Instant;

  fn spy(calls: Arc<AtomicUsize>, result: Result<(), HandlerError>) -> Arc<dyn Handler> {
    Arc::new(handler_fn(move |_| {
      let calls = Arc::clone(&calls);
      let result = result.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        result
      }
    }))
  }

  fn app(online: bool, handler: Arc<dyn Handler>) -> App {
    let mut registry = Registry::new();
    registry.register(Action::UpdatePhaseStatus, handler);
    App::with_parts(
      Config::default(),
      Arc::new(SqliteQueue::in_memory().unwrap()),
      registry,
      NetworkMonitor::new(online),
    )
  }

  fn item() -> NewWorkItem {
    NewWorkItem::new(
      Action::UpdatePhaseStatus,
      Payload::new(json!({"phase_id": 3, "status": "complete"})),
    )
  }

  fn pending(app: &App) -> usize {
    app.engine().status().unwrap().counts.pending
  }

  async fn wait_until_empty(app: &App, limit: Duration) {
    tokio::time::timeout(limit, async {
      while pending(app) > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();
  }

  /// Spy that fails transiently on the listed call indexes.
  fn flaky(calls: Arc<AtomicUsize>, failing: &'static [usize]) -> Arc<dyn Handler> {
    Arc::new(handler_fn(move |_| {
      let calls = Arc::clone(&calls);
      async move {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if failing.contains(&n) {
          Err(HandlerError::Transient("server returned 503".to_string()))
        } else {
          Ok(())
        }
      }
    }))
  }

  fn start_watch(app: &Arc<App>) -> (mpsc::UnboundedSender<Event>, JoinHandle<Result<()>>) {
    let events = EventHandler::new(app.monitor());
    let tx = events.sender();
    let app = Arc::clone(app);
    (tx, tokio::spawn(async move { app.watch(events).await }))
  }

  #[tokio::test]
  async fn test_online_success_never_touches_queue() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(true, spy(Arc::clone(&calls), Ok(())));

    assert_eq!(app.submit(item()).await.unwrap(), Submitted::Sent);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pending(&app), 0);
  }

  #[tokio::test]
  async fn test_online_transient_failure_is_queued() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(
      true,
      spy(
        Arc::clone(&calls),
        Err(HandlerError::Transient("server returned 502".to_string())),
      ),
    );

    let submitted = app.submit(item()).await.unwrap();
    assert!(matches!(submitted, Submitted::Queued(_)));
    let queued = app.engine().store().list_pending().unwrap();
    assert_eq!(queued.len(), 1);
    // the direct attempt is not counted against the item
    assert_eq!(queued[0].retry_count, 0);
  }

  #[tokio::test]
  async fn test_online_rejection_is_returned_not_queued() {
    let app = app(
      true,
      spy(
        Arc::new(AtomicUsize::new(0)),
        Err(HandlerError::Permanent("server returned 422".to_string())),
      ),
    );

    assert!(app.submit(item()).await.is_err());
    assert_eq!(pending(&app), 0);
  }

  #[tokio::test]
  async fn test_offline_submit_queues_without_calling() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(false, spy(Arc::clone(&calls), Ok(())));

    let submitted = app.submit(item()).await.unwrap();
    assert!(matches!(submitted, Submitted::Queued(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pending(&app), 1);
  }

  #[tokio::test]
  async fn test_watch_drains_on_online_edge() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Arc::new(app(false, spy(Arc::clone(&calls), Ok(()))));
    for _ in 0..3 {
      app.submit(item()).await.unwrap();
    }

    let events = EventHandler::new(app.monitor());
    let tx = events.sender();
    let watcher = {
      let app = Arc::clone(&app);
      tokio::spawn(async move { app.watch(events).await })
    };

    app.monitor().report(true);
    tokio::time::timeout(Duration::from_secs(5), async {
      while pending(&app) > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tx.send(Event::Shutdown).unwrap();
    watcher.await.unwrap().unwrap();
    let last = app.engine().status().unwrap().last_drain.unwrap();
    assert_eq!(last.synced, 3);
  }

  #[tokio::test]
  async fn test_watch_drains_pending_items_on_startup() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Arc::new(app(false, spy(Arc::clone(&calls), Ok(()))));
    app.submit(item()).await.unwrap();
    app.monitor().report(true);

    let events = EventHandler::new(app.monitor());
    let tx = events.sender();
    let watcher = {
      let app = Arc::clone(&app);
      tokio::spawn(async move { app.watch(events).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
      while pending(&app) > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();

    tx.send(Event::Shutdown).unwrap();
    watcher.await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
  #[tokio::test(start_paused = true)]
  async fn test_watch_backs_off_between_follow_up_drains() {
    let calls = Arc::new(AtomicUsize::new(0));
    // calls 0 and 1 are drains, 3 is a direct submit, 4 its first drain
    let app = Arc::new(app(false, flaky(Arc::clone(&calls), &[0, 1, 3, 4])));
    app.submit(item()).await.unwrap();

    let (tx, watcher) = start_watch(&app);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    app.monitor().report(true);
    wait_until_empty(&app, Duration::from_secs(120)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 2s after the first failure, 4s after the second
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(6), "{waited:?}");
    assert!(waited < Duration::from_secs(7), "{waited:?}");

    // the clean pass resets the delay
    assert!(matches!(
      app.submit(item()).await.unwrap(),
      Submitted::Queued(_)
    ));
    let started = Instant::now();
    tx.send(Event::SyncNow).unwrap();
    wait_until_empty(&app, Duration::from_secs(120)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(2), "{waited:?}");
    assert!(waited < Duration::from_secs(3), "{waited:?}");

    tx.send(Event::Shutdown).unwrap();
    watcher.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_watch_resumes_after_offline_blip_mid_pass() {
    let calls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let handler: Arc<dyn Handler> = {
      let calls = Arc::clone(&calls);
      let started = Arc::clone(&started);
      let release = Arc::clone(&release);
      Arc::new(handler_fn(move |_| {
        let calls = Arc::clone(&calls);
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        async move {
          if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            started.notify_one();
            release.notified().await;
          }
          Ok(())
        }
      }))
    };
    let app = Arc::new(app(false, handler));
    for _ in 0..3 {
      app.submit(item()).await.unwrap();
    }

    let (tx, watcher) = start_watch(&app);
    tokio::time::sleep(Duration::from_millis(10)).await;
    app.monitor().report(true);
    started.notified().await;

    // drop and regain the connection while the first item is in flight
    app.monitor().report(false);
    app.monitor().report(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_one();

    wait_until_empty(&app, Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(app.monitor().is_online());

    tx.send(Event::Shutdown).unwrap();
    watcher.await.unwrap().unwrap();
    let last = app.engine().status().unwrap().last_drain.unwrap();
    assert_eq!(last.synced, 2);
    assert!(!last.abandoned);
  }

  #[tokio::test]
  async fn test_offline_edge_stops_pass_inside_watch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let handler: Arc<dyn Handler> = {
      let calls = Arc::clone(&calls);
      let started = Arc::clone(&started);
      let release = Arc::clone(&release);
      Arc::new(handler_fn(move |_| {
        let calls = Arc::clone(&calls);
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          started.notify_one();
          release.notified().await;
          Ok(())
        }
      }))
    };
    let app = Arc::new(app(false, handler));
    for _ in 0..3 {
      app.submit(item()).await.unwrap();
    }

    let (tx, watcher) = start_watch(&app);
    tokio::time::sleep(Duration::from_millis(10)).await;
    app.monitor().report(true);
    started.notified().await;
    app.monitor().report(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_one();

    tokio::time::timeout(Duration::from_secs(5), async {
      while app.engine().status().unwrap().last_drain.is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();
    let last = app.engine().status().unwrap().last_drain.unwrap();
    assert!(last.abandoned);
    assert_eq!(last.synced, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pending(&app), 2);
    for queued in app.engine().store().list_pending().unwrap() {
      assert_eq!(queued.retry_count, 0);
    }

    tx.send(Event::Shutdown).unwrap();
    watcher.await.unwrap().unwrap();
  }
}
