//! Command-line subcommands and their handlers.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::io::AsyncRead;

use crate::app::{App, Submitted};
use crate::cache::{CacheSource, CachedHttpClient};
use crate::capture::{CaptureOptions, CaptureSession, ReaderSource};
use crate::config::Config;
use crate::event::EventHandler;
use crate::network::{NetworkMonitor, TcpProbe};
use crate::queue::{Attachment, NewWorkItem, Payload, QueueStore, WorkId, WorkItem};
use crate::registry::Action;
use crate::sync::ItemOutcome;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Run an action now, or queue it when the server is unreachable
  Submit {
    /// Action name, e.g. update_phase_status
    action: String,
    /// JSON payload
    #[arg(default_value = "{}")]
    payload: String,
    /// Files to attach to the payload
    #[arg(short, long)]
    attach: Vec<PathBuf>,
  },
  /// Drain the queue once
  Sync,
  /// Show pending counts and the last sync outcome
  Status,
  /// List queued items
  List,
  /// Retry one item, ignoring the retry limit
  Retry { id: String },
  /// Delete one queued item
  Discard { id: String },
  /// Fetch a server path through the cache
  Fetch {
    path: String,
    /// Treat as a page navigation
    #[arg(long)]
    page: bool,
  },
  /// Precache and switch to a cache generation
  Activate {
    /// Generation tag (defaults to the configured one)
    generation: Option<String>,
  },
  /// Record a voice command from 16-bit mono PCM and submit it
  Record {
    /// PCM input file, or - for stdin
    #[arg(short, long, default_value = "-")]
    input: PathBuf,
    /// Declared command type
    #[arg(short = 't', long, default_value = "voice_memo")]
    command_type: String,
  },
  /// Keep the queue drained, syncing whenever the server comes back
  Watch,
}

/// Execute `command`.
pub async fn run(
  command: Command,
  config: Config,
  monitor: NetworkMonitor,
  probe: Option<TcpProbe>,
) -> Result<()> {
  match command {
    Command::Submit {
      action,
      payload,
      attach,
    } => {
      let app = App::new(config, monitor)?;
      let data =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let mut payload = Payload::new(data);
      for path in attach {
        let bytes = tokio::fs::read(&path)
          .await
          .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
        let name = path
          .file_name()
          .map(|n| n.to_string_lossy().into_owned())
          .unwrap_or_else(|| "attachment".to_string());
        payload =
          payload.with_attachment(Attachment::new(name, "application/octet-stream", bytes));
      }

      let submitted = app
        .submit(NewWorkItem::new(Action::from_name(&action), payload))
        .await?;
      print_submitted(&submitted);
    }

    Command::Sync => {
      let app = App::new(config, monitor)?;
      if !app.monitor().is_online() {
        println!("offline, nothing synced");
        return Ok(());
      }
      match app.engine().drain().await? {
        Some(report) => println!("{}", report.summary()),
        None => println!("a sync is already running"),
      }
    }

    Command::Status => {
      let app = App::new(config, monitor)?;
      let status = app.engine().status()?;
      let online = if app.monitor().is_online() {
        "online"
      } else {
        "offline"
      };
      println!("{online}");
      println!(
        "pending: {} (retryable {}, stalled {})",
        status.counts.pending, status.counts.retryable, status.counts.stalled
      );
      match status.last_drain {
        Some(report) => println!(
          "last sync: {} at {}",
          report.summary(),
          report.finished_at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("last sync: never"),
      }
    }

    Command::List => {
      let app = App::new(config, monitor)?;
      let max_retries = app.engine().policy().max_retries;
      for item in app.engine().store().list_all()? {
        println!("{}", format_item(&item, max_retries));
      }
    }

    Command::Retry { id } => {
      let app = App::new(config, monitor)?;
      let id = parse_id(&id)?;
      match app.engine().retry_item(id).await? {
        Some(ItemOutcome::Synced) => println!("synced {id}"),
        Some(ItemOutcome::Failed { retry_count, error }) => {
          println!("failed again ({retry_count} attempts): {error}")
        }
        Some(ItemOutcome::Rejected { error }) => println!("rejected: {error}"),
        None => println!("a sync is already running"),
      }
    }

    Command::Discard { id } => {
      let app = App::new(config, monitor)?;
      let id = parse_id(&id)?;
      app.engine().discard(id)?;
      println!("discarded {id}");
    }

    Command::Fetch { path, page } => {
      let client = CachedHttpClient::new(&config, monitor)?;
      client.cache().purge_stale()?;
      let request = client.request(&path, page)?;
      let result = client.fetch(&request).await?;
      let source = match result.source {
        CacheSource::Network => "network",
        CacheSource::Cache => "cache",
        CacheSource::Offline => "cache (offline)",
        CacheSource::Placeholder => "offline placeholder",
        CacheSource::Unavailable => "unavailable",
      };
      eprintln!("{} from {}", result.data.status, source);
      println!("{}", String::from_utf8_lossy(&result.data.body));
    }

    Command::Activate { generation } => {
      let generation = generation.unwrap_or_else(|| config.cache.generation.clone());
      let client = CachedHttpClient::new(&config, monitor)?;
      let purged = client
        .install_and_activate(&generation, &config.cache.precache)
        .await?;
      println!("activated {generation}, purged {purged} old entries");
    }

    Command::Record {
      input,
      command_type,
    } => {
      let app = App::new(config, monitor)?;
      let reader: Box<dyn AsyncRead + Unpin + Send> = if input.as_os_str() == "-" {
        Box::new(tokio::io::stdin())
      } else {
        Box::new(
          tokio::fs::File::open(&input)
            .await
            .map_err(|e| eyre!("recording failed to start: {}: {}", input.display(), e))?,
        )
      };

      let (session, cancel) = CaptureSession::new(CaptureOptions::from(&app.config().capture));
      let mut levels = session.levels();
      tokio::spawn(async move {
        while levels.changed().await.is_ok() {
          let level = *levels.borrow_and_update();
          eprint!("\rlevel {:>3}%", (level * 100.0).round() as u32);
        }
      });
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          cancel.cancel();
        }
      });

      let recording = session
        .record(&mut ReaderSource::new(reader), &command_type)
        .await?;
      eprintln!();
      if recording.truncated {
        eprintln!("stopped at the maximum duration");
      }
      println!("recorded {} ms", recording.meta.duration_ms);
      let submitted = app.submit_recording(recording).await?;
      print_submitted(&submitted);
    }

    Command::Watch => {
      let app = App::new(config, monitor)?;
      let probe_task = probe.map(|probe| app.monitor().spawn_probe(probe));
      let events = EventHandler::new(app.monitor()).with_ctrl_c();
      let result = app.watch(events).await;
      if let Some(task) = probe_task {
        task.abort();
      }
      result?;
    }
  }

  Ok(())
}

fn parse_id(raw: &str) -> Result<WorkId> {
  raw
    .parse()
    .map_err(|e| eyre!("Invalid work item id {}: {}", raw, e))
}

fn print_submitted(submitted: &Submitted) {
  match submitted {
    Submitted::Sent => println!("sent"),
    Submitted::Queued(id) => println!("queued {id}"),
  }
}

fn format_item(item: &WorkItem, max_retries: u32) -> String {
  let state = if item.permanent {
    "rejected".to_string()
  } else if item.status.is_pending() && item.retry_count >= max_retries {
    "stalled".to_string()
  } else {
    item.status.to_string()
  };

  let mut line = format!(
    "{}  {:<8}  {}/{}  {}  {}",
    item.id,
    state,
    item.retry_count,
    max_retries,
    item.created_at.format("%Y-%m-%d %H:%M:%S"),
    item.action
  );
  if let Some(error) = &item.last_error {
    line.push_str(&format!("  ({error})"));
  }
  line
}
