//! Connectivity tracking.
//!
//! `is_online` is a best-effort platform signal, not a promise that the
//! server is reachable. Subscribers only hear about edges: reporting the
//! same state twice is silent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A connectivity edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Online,
  Offline,
}

/// Shared connectivity state with edge notifications.
#[derive(Clone)]
pub struct NetworkMonitor {
  online: Arc<AtomicBool>,
  edges: broadcast::Sender<Transition>,
}

impl NetworkMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (edges, _) = broadcast::channel(16);
    Self {
      online: Arc::new(AtomicBool::new(initially_online)),
      edges,
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Record the platform's view of connectivity. Returns the edge, if any.
  pub fn report(&self, online: bool) -> Option<Transition> {
    let was_online = self.online.swap(online, Ordering::SeqCst);
    if was_online == online {
      return None;
    }

    let transition = if online {
      Transition::Online
    } else {
      Transition::Offline
    };
    info!(?transition, "connectivity changed");
    // no subscribers is fine
    let _ = self.edges.send(transition);
    Some(transition)
  }

  pub fn subscribe(&self) -> Subscription {
    Subscription {
      rx: self.edges.subscribe(),
    }
  }

  /// Run `probe` in the background, reporting each result.
  pub fn spawn_probe(&self, probe: TcpProbe) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      loop {
        let online = probe.check().await;
        monitor.report(online);
        tokio::time::sleep(probe.interval).await;
      }
    })
  }
}

/// Receiver of connectivity edges.
pub struct Subscription {
  rx: broadcast::Receiver<Transition>,
}

impl Subscription {
  /// Wait for the next edge. `None` once the monitor is gone.
  pub async fn next(&mut self) -> Option<Transition> {
    loop {
      match self.rx.recv().await {
        Ok(transition) => return Some(transition),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          debug!(skipped, "connectivity subscriber lagged");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }
}

/// Connectivity check by opening a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
  pub addr: String,
  pub timeout: Duration,
  pub interval: Duration,
}

impl TcpProbe {
  pub fn new(addr: impl Into<String>, timeout: Duration, interval: Duration) -> Self {
    Self {
      addr: addr.into(),
      timeout,
      interval,
    }
  }

  pub async fn check(&self) -> bool {
    matches!(
      tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await,
      Ok(Ok(_))
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn test_report_emits_only_edges() {
    let monitor = NetworkMonitor::new(false);
    let mut sub = monitor.subscribe();

    assert_eq!(monitor.report(false), None);
    assert_eq!(monitor.report(true), Some(Transition::Online));
    assert_eq!(monitor.report(true), None);
    assert_eq!(monitor.report(false), Some(Transition::Offline));

    assert_eq!(sub.next().await, Some(Transition::Online));
    assert_eq!(sub.next().await, Some(Transition::Offline));
    assert!(!monitor.is_online());
  }

  #[tokio::test]
  async fn test_clones_share_state() {
    let monitor = NetworkMonitor::new(true);
    let other = monitor.clone();
    other.report(false);
    assert!(!monitor.is_online());
  }

  #[tokio::test]
  async fn test_tcp_probe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let probe = TcpProbe::new(addr, Duration::from_secs(1), Duration::from_secs(1));
    assert!(probe.check().await);

    drop(listener);
    let closed = TcpProbe::new("127.0.0.1:9", Duration::from_millis(200), Duration::ZERO);
    assert!(!closed.check().await);
  }

  #[tokio::test]
  async fn test_spawned_probe_reports_online() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let monitor = NetworkMonitor::new(false);
    let mut sub = monitor.subscribe();

    let task = monitor.spawn_probe(TcpProbe::new(
      addr,
      Duration::from_secs(1),
      Duration::from_millis(50),
    ));
    let edge = tokio::time::timeout(Duration::from_secs(2), sub.next())
      .await
      .unwrap();
    task.abort();

    assert_eq!(edge, Some(Transition::Online));
    assert!(monitor.is_online());
  }
}
