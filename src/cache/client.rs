//! HTTP client that wraps reqwest with transparent request caching.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::time::Duration;
use url::Url;

use super::layer::CacheLayer;
use super::routes::RouteTable;
use super::storage::SqliteStorage;
use super::traits::{CacheRequest, CacheResult, CachedResponse};
use crate::config::Config;
use crate::network::NetworkMonitor;

/// HTTP client for read traffic.
///
/// Every request goes through the cache layer. While the monitor reports
/// offline, fetches fail immediately instead of waiting on a dead network.
#[derive(Clone)]
pub struct CachedHttpClient {
  http: reqwest::Client,
  base: Url,
  cache: CacheLayer<SqliteStorage>,
  monitor: NetworkMonitor,
}

impl CachedHttpClient {
  /// Create a client backed by `cache.db` in the data directory.
  pub fn new(config: &Config, monitor: NetworkMonitor) -> Result<Self> {
    let storage = SqliteStorage::open(config.data_dir()?.join("cache.db"))?;
    let cache = CacheLayer::new(
      storage,
      RouteTable::from_config(&config.cache),
      &config.cache.generation,
    )?;
    Self::with_cache(config, cache, monitor)
  }

  pub fn with_cache(
    config: &Config,
    cache: CacheLayer<SqliteStorage>,
    monitor: NetworkMonitor,
  ) -> Result<Self> {
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
      cache,
      monitor,
    })
  }

  pub fn cache(&self) -> &CacheLayer<SqliteStorage> {
    &self.cache
  }

  /// Build a request for a server path. `navigate` marks a page load.
  pub fn request(&self, path: &str, navigate: bool) -> Result<CacheRequest> {
    let url = self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;
    Ok(if navigate {
      CacheRequest::navigate(url)
    } else {
      CacheRequest::get(url)
    })
  }

  /// Fetch through the cache layer.
  pub async fn fetch(&self, request: &CacheRequest) -> Result<CacheResult<CachedResponse>> {
    self
      .cache
      .handle(request, || self.fetch_network(request.clone()))
      .await
  }

  /// Precache the configured pages into `generation` and activate it.
  pub async fn install_and_activate(&self, generation: &str, paths: &[String]) -> Result<usize> {
    let precache = paths
      .iter()
      .map(|path| self.request(path, true))
      .collect::<Result<Vec<_>>>()?;

    self
      .cache
      .install(generation, &precache, |request| self.fetch_network(request))
      .await?;
    self.cache.activate(generation)
  }

  async fn fetch_network(&self, request: CacheRequest) -> Result<CachedResponse> {
    if !self.monitor.is_online() {
      return Err(eyre!("offline"));
    }

    let mut builder = self.http.request(request.method.clone(), request.url.clone());
    if let Some(accept) = &request.accept {
      builder = builder.header(ACCEPT, accept);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", request.url, e))?;

    Ok(CachedResponse {
      status,
      content_type,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;

  fn client(online: bool) -> CachedHttpClient {
    let config = Config::default();
    let cache = CacheLayer::new(
      SqliteStorage::in_memory().unwrap(),
      RouteTable::from_config(&config.cache),
      "v1",
    )
    .unwrap();
    CachedHttpClient::with_cache(&config, cache, NetworkMonitor::new(online)).unwrap()
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_offline_document() {
    let client = client(false);
    let request = client.request("/projects/4", true).unwrap();

    let result = client.fetch(&request).await.unwrap();
    assert_eq!(result.source, CacheSource::Placeholder);
    assert_eq!(result.data.status, 503);
  }

  #[tokio::test]
  async fn test_offline_pass_through_fails_fast() {
    let client = client(false);
    let request = client.request("/api/phases", false).unwrap();
    assert!(client.fetch(&request).await.is_err());
  }

  #[tokio::test]
  async fn test_install_offline_leaves_generation_alone() {
    let client = client(false);
    let paths = vec!["/".to_string()];
    assert!(client.install_and_activate("v2", &paths).await.is_err());
    assert_eq!(client.cache().generation().unwrap(), "v1");
  }
}
