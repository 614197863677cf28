//! HTTP executor for queued mutations.
//!
//! Each action is posted to `{server}{sync_path}/{action}`. The response
//! status decides how the sync engine treats a failure: 2xx succeeds, the
//! configured permanent range is a rejection, everything else (transport
//! errors, timeouts, 5xx) is retried later.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{Config, StatusPolicy};
use crate::error::HandlerError;
use crate::queue::Payload;
use crate::registry::{Action, Handler};

/// Shared HTTP client for the sync endpoint.
#[derive(Clone)]
pub struct RemoteClient {
  http: reqwest::Client,
  base: Url,
  sync_path: String,
  token: Option<String>,
  policy: StatusPolicy,
}

/// Wire body for one mutation.
#[derive(Debug, Serialize)]
struct SyncRequest<'a> {
  action: &'a str,
  payload: &'a serde_json::Value,
  attachments: Vec<WireAttachment<'a>>,
}

#[derive(Debug, Serialize)]
struct WireAttachment<'a> {
  name: &'a str,
  content_type: &'a str,
  /// Hex-encoded bytes
  data: String,
}

impl RemoteClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = Url::parse(&config.server.url)
      .map_err(|e| eyre!("Invalid server url {}: {}", config.server.url, e))?;

    let http = reqwest::Client::builder()
      .timeout(config.sync.handler_timeout())
      .connect_timeout(Duration::from_millis(config.network.probe_timeout_ms.max(1)))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      sync_path: config.server.sync_path.clone(),
      token: Config::get_api_token(),
      policy: config.sync.permanent_status.clone(),
    })
  }

  /// Handler posting `action` through this client.
  pub fn handler(&self, action: &Action) -> RemoteHandler {
    RemoteHandler {
      client: self.clone(),
      action: action.clone(),
    }
  }

  fn endpoint(&self, action: &Action) -> Result<Url, HandlerError> {
    let path = format!(
      "{}/{}",
      self.sync_path.trim_end_matches('/'),
      action.as_str()
    );
    self
      .base
      .join(&path)
      .map_err(|e| HandlerError::Permanent(format!("cannot build url for {action}: {e}")))
  }

  /// Send one mutation and classify the outcome.
  pub async fn send(&self, action: &Action, payload: &Payload) -> Result<(), HandlerError> {
    let url = self.endpoint(action)?;
    let body = SyncRequest {
      action: action.as_str(),
      payload: &payload.data,
      attachments: payload
        .attachments
        .iter()
        .map(|a| WireAttachment {
          name: &a.name,
          content_type: &a.content_type,
          data: hex::encode(&a.bytes),
        })
        .collect(),
    };

    let mut request = self.http.post(url.clone()).json(&body);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| HandlerError::Transient(format!("request to {url} failed: {e}")))?;

    let status = response.status();
    debug!(%url, %status, "sync call returned");
    if status.is_success() {
      return Ok(());
    }

    let detail = response.text().await.unwrap_or_default();
    Err(classify_failure(&self.policy, status, &detail))
  }
}

/// Map a non-success status to a handler error.
pub fn classify_failure(policy: &StatusPolicy, status: StatusCode, detail: &str) -> HandlerError {
  let message = if detail.trim().is_empty() {
    format!("server returned {status}")
  } else {
    let detail: String = detail.trim().chars().take(200).collect();
    format!("server returned {status}: {detail}")
  };

  if policy.is_permanent(status.as_u16()) {
    HandlerError::Permanent(message)
  } else {
    HandlerError::Transient(message)
  }
}

/// Registry entry for one remote action.
pub struct RemoteHandler {
  client: RemoteClient,
  action: Action,
}

impl Handler for RemoteHandler {
  fn execute<'a>(&'a self, payload: &'a Payload) -> BoxFuture<'a, Result<(), HandlerError>> {
    Box::pin(self.client.send(&self.action, payload))
  }
}
