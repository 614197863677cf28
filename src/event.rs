use tokio::sync::mpsc;
use tracing::debug;

use crate::network::{NetworkMonitor, Transition};
use crate::sync::DrainReport;

/// Application events
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// Connectivity edge from the network monitor
  Network(Transition),
  /// Explicit "sync now" or a scheduled retry
  SyncNow,
  /// A drain pass finished
  Drained(DrainReport),
  /// A drain pass found the engine busy and did nothing
  DrainSkipped,
  /// A drain pass failed on storage
  DrainFailed(String),
  /// Ctrl-C or teardown
  Shutdown,
}

/// Event handler that merges connectivity edges, interrupts, and events
/// sent by background tasks into one stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a handler fed by `monitor`
  pub fn new(monitor: &NetworkMonitor) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Forward connectivity edges
    let mut edges = monitor.subscribe();
    let edge_tx = tx.clone();
    tokio::spawn(async move {
      while let Some(transition) = edges.next().await {
        if edge_tx.send(Event::Network(transition)).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Also emit `Shutdown` on Ctrl-C
  pub fn with_ctrl_c(self) -> Self {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        debug!("interrupt received");
        let _ = tx.send(Event::Shutdown);
      }
    });
    self
  }

  /// Sender for tasks that report back to the loop
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
