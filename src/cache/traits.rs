//! Request and response types shared by the cache layer.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// An outbound read request as seen by the interception layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
  pub method: Method,
  pub url: Url,
  /// Value of the Accept header, if any
  pub accept: Option<String>,
}

impl CacheRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      accept: None,
    }
  }

  /// A full-page navigation (asks for HTML).
  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      accept: Some("text/html".to_string()),
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.method == Method::GET
      && self
        .accept
        .as_deref()
        .is_some_and(|accept| accept.contains("text/html"))
  }

  /// Stable storage key: SHA-256 of `METHOD url`.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response snapshot, stored or served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn new(status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      content_type: content_type.map(String::from),
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Minimal locally-rendered page for navigations with no network and no cache.
  pub fn offline_document() -> Self {
    Self::new(
      503,
      Some("text/html; charset=utf-8"),
      OFFLINE_DOCUMENT.as_bytes(),
    )
  }

  /// Placeholder for data requests with no network and no cache.
  pub fn offline_placeholder() -> Self {
    Self::new(
      503,
      Some("application/json"),
      r#"{"offline":true,"error":"network unavailable and no cached copy"}"#.as_bytes(),
    )
  }

  /// Failure for a cache-first asset that is neither cached nor reachable.
  pub fn gateway_timeout() -> Self {
    Self::new(504, Some("text/plain"), "offline and not cached".as_bytes())
  }
}

const OFFLINE_DOCUMENT: &str = "<!doctype html>
<html>
<head><meta charset=\"utf-8\"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>This page has not been saved on this device. Changes you make are queued and will sync when the connection returns.</p>
</body>
</html>
";

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Network failed; serving the last cached copy.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn synthesized(data: T, source: CacheSource) -> Self {
    Self {
      data,
      source,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Network unavailable, serving cached data
  Offline,
  /// Network unavailable, nothing cached; synthesized offline response
  Placeholder,
  /// Cache-first asset neither cached nor reachable
  Unavailable,
}
