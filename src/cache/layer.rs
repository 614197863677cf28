//! Cache layer that routes each request through its strategy.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::routes::{RouteTable, Strategy};
use super::storage::{CacheStorage, CachedEntry, NewEntry};
use super::traits::{CacheRequest, CacheResult, CacheSource, CachedResponse};

/// Cache layer that manages caching logic and network fetching.
///
/// Reads never fail: network errors fall back to the cache and then to a
/// synthesized response. Only pass-through requests surface the network
/// error. Lookups and runtime writes only touch the current generation.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  routes: Arc<RouteTable>,
  generation: Arc<RwLock<String>>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a cache layer. The generation recorded in storage wins over
  /// `fallback_generation`, which only applies before the first activation.
  pub fn new(storage: S, routes: RouteTable, fallback_generation: &str) -> Result<Self> {
    let generation = storage
      .current_generation()?
      .unwrap_or_else(|| fallback_generation.to_string());

    Ok(Self {
      storage: Arc::new(storage),
      routes: Arc::new(routes),
      generation: Arc::new(RwLock::new(generation)),
    })
  }

  /// Generation currently served.
  pub fn generation(&self) -> Result<String> {
    self
      .generation
      .read()
      .map(|g| g.clone())
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn classify(&self, request: &CacheRequest) -> Strategy {
    self.routes.classify(request)
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Serve `request`, calling `fetcher` when the strategy needs the network.
  ///
  /// Returns an error only for pass-through requests whose fetch failed.
  pub async fn handle<F, Fut>(
    &self,
    request: &CacheRequest,
    fetcher: F,
  ) -> Result<CacheResult<CachedResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>>,
  {
    let strategy = self.classify(request);
    debug!(url = %request.url, ?strategy, "intercepted request");

    match strategy {
      Strategy::PassThrough => fetcher().await.map(CacheResult::from_network),
      Strategy::CacheFirst => Ok(self.cache_first(request, fetcher).await),
      Strategy::NetworkFirst => Ok(self.network_first(request, fetcher).await),
    }
  }

  async fn cache_first<F, Fut>(
    &self,
    request: &CacheRequest,
    fetcher: F,
  ) -> CacheResult<CachedResponse>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>>,
  {
    if let Some(cached) = self.lookup(request) {
      return CacheResult::from_cache(cached.response, cached.cached_at);
    }

    match fetcher().await {
      Ok(response) => {
        self.store(request, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, "asset unavailable: {e}");
        CacheResult::synthesized(CachedResponse::gateway_timeout(), CacheSource::Unavailable)
      }
    }
  }

  async fn network_first<F, Fut>(
    &self,
    request: &CacheRequest,
    fetcher: F,
  ) -> CacheResult<CachedResponse>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.store(request, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, "network failed, falling back: {e}");
        if let Some(cached) = self.lookup(request) {
          return CacheResult::offline(cached.response, cached.cached_at);
        }

        let placeholder = if request.is_navigation() {
          CachedResponse::offline_document()
        } else {
          CachedResponse::offline_placeholder()
        };
        CacheResult::synthesized(placeholder, CacheSource::Placeholder)
      }
    }
  }

  /// Read from the current generation. Storage errors count as a miss.
  fn lookup(&self, request: &CacheRequest) -> Option<CachedEntry> {
    let generation = self.generation().ok()?;
    match self.storage.get(&generation, &request.cache_key()) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %request.url, "cache read failed: {e}");
        None
      }
    }
  }

  /// Write into the current generation. Only successful responses are kept.
  fn store(&self, request: &CacheRequest, response: &CachedResponse) {
    if !response.is_success() {
      return;
    }
    let Ok(generation) = self.generation() else {
      return;
    };

    let entry = NewEntry {
      key: request.cache_key(),
      url: request.url.to_string(),
      response: response.clone(),
    };
    if let Err(e) = self.storage.put(&generation, &entry) {
      warn!(url = %request.url, "cache write failed: {e}");
    }
  }

  /// Fetch every precache request into `generation` without making it
  /// current. Either all responses are stored or none are.
  pub async fn install<F, Fut>(
    &self,
    generation: &str,
    precache: &[CacheRequest],
    fetcher: F,
  ) -> Result<usize>
  where
    F: Fn(CacheRequest) -> Fut,
    Fut: Future<Output = Result<CachedResponse>>,
  {
    let mut entries = Vec::with_capacity(precache.len());
    for request in precache {
      let response = fetcher(request.clone())
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: server returned {}",
          request.url,
          response.status
        ));
      }
      entries.push(NewEntry {
        key: request.cache_key(),
        url: request.url.to_string(),
        response,
      });
    }

    self.storage.put_all(generation, &entries)?;
    info!(generation, count = entries.len(), "installed cache generation");
    Ok(entries.len())
  }

  /// Make `generation` current and purge every other one.
  pub fn activate(&self, generation: &str) -> Result<usize> {
    let mut current = self
      .generation
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let purged = self.storage.activate(generation)?;
    *current = generation.to_string();
    Ok(purged)
  }

  /// Remove leftovers of non-current generations.
  pub fn purge_stale(&self) -> Result<usize> {
    let generation = self.generation()?;
    self.storage.purge_except(&generation)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      routes: Arc::clone(&self.routes),
      generation: Arc::clone(&self.generation),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::CacheConfig;
  use reqwest::Method;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use url::Url;

  fn layer() -> CacheLayer<SqliteStorage> {
    CacheLayer::new(
      SqliteStorage::in_memory().unwrap(),
      RouteTable::from_config(&CacheConfig::default()),
      "v1",
    )
    .unwrap()
  }

  fn url(path: &str) -> Url {
    Url::parse("https://pm.example.com").unwrap().join(path).unwrap()
  }

  fn ok(body: &str) -> Result<CachedResponse> {
    Ok(CachedResponse::new(200, Some("text/plain"), body.as_bytes()))
  }

  fn offline() -> Result<CachedResponse> {
    Err(eyre!("connection refused"))
  }

  #[tokio::test]
  async fn test_cache_first_serves_cache_without_network() {
    let cache = layer();
    let request = CacheRequest::get(url("/static/app.css"));
    let fetches = AtomicUsize::new(0);

    let first = cache
      .handle(&request, || async {
        fetches.fetch_add(1, Ordering::SeqCst);
        ok("body{}")
      })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = cache
      .handle(&request, || async {
        fetches.fetch_add(1, Ordering::SeqCst);
        ok("changed")
      })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.body, b"body{}");
    assert!(second.cached_at.is_some());
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_while_offline_is_explicit_failure() {
    let cache = layer();
    let request = CacheRequest::get(url("/icons/phase.png"));

    let result = cache.handle(&request, || async { offline() }).await.unwrap();
    assert_eq!(result.source, CacheSource::Unavailable);
    assert_eq!(result.data.status, 504);
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let cache = layer();
    let request = CacheRequest::get(url("/projects/7"));

    cache.handle(&request, || async { ok("fresh") }).await.unwrap();
    let result = cache.handle(&request, || async { offline() }).await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"fresh");
  }

  #[tokio::test]
  async fn test_network_first_refreshes_cache() {
    let cache = layer();
    let request = CacheRequest::get(url("/projects/7"));

    cache.handle(&request, || async { ok("one") }).await.unwrap();
    let live = cache.handle(&request, || async { ok("two") }).await.unwrap();
    assert_eq!(live.source, CacheSource::Network);

    let fallback = cache.handle(&request, || async { offline() }).await.unwrap();
    assert_eq!(fallback.data.body, b"two");
  }

  #[tokio::test]
  async fn test_network_first_without_cache_returns_placeholder() {
    let cache = layer();

    let data = cache
      .handle(&CacheRequest::get(url("/projects/9/phases")), || async {
        offline()
      })
      .await
      .unwrap();
    assert_eq!(data.source, CacheSource::Placeholder);
    assert_eq!(data.data.content_type.as_deref(), Some("application/json"));

    let page = cache
      .handle(&CacheRequest::navigate(url("/projects/9")), || async {
        offline()
      })
      .await
      .unwrap();
    assert_eq!(page.source, CacheSource::Placeholder);
    assert!(String::from_utf8_lossy(&page.data.body).contains("You are offline"));
  }

  #[tokio::test]
  async fn test_error_responses_are_not_cached() {
    let cache = layer();
    let request = CacheRequest::get(url("/projects/7"));

    let served = cache
      .handle(&request, || async {
        Ok(CachedResponse::new(500, None, Vec::new()))
      })
      .await
      .unwrap();
    assert_eq!(served.data.status, 500);

    let fallback = cache.handle(&request, || async { offline() }).await.unwrap();
    assert_eq!(fallback.source, CacheSource::Placeholder);
  }

  #[tokio::test]
  async fn test_pass_through_is_never_cached() {
    let cache = layer();
    let request = CacheRequest::get(url("/api/phases/3"));

    cache.handle(&request, || async { ok("live") }).await.unwrap();
    assert!(cache.handle(&request, || async { offline() }).await.is_err());

    let post = CacheRequest::get(url("/projects/7")).with_method(Method::POST);
    assert!(cache.handle(&post, || async { offline() }).await.is_err());
    assert!(cache.storage().generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let cache = layer();
    let precache = vec![
      CacheRequest::navigate(url("/")),
      CacheRequest::navigate(url("/offline")),
    ];

    let result = cache
      .install("v2", &precache, |request| async move {
        if request.url.path() == "/offline" {
          offline()
        } else {
          ok("home")
        }
      })
      .await;
    assert!(result.is_err());
    assert!(cache.storage().generations().unwrap().is_empty());
    assert_eq!(cache.generation().unwrap(), "v1");
  }

  #[tokio::test]
  async fn test_activation_cuts_over_every_asset() {
    let cache = layer();
    let app_js = CacheRequest::get(url("/static/app.js"));
    let app_css = CacheRequest::get(url("/static/app.css"));

    cache.handle(&app_js, || async { ok("js v1") }).await.unwrap();
    cache.handle(&app_css, || async { ok("css v1") }).await.unwrap();

    let installed = cache
      .install("v2", &[app_js.clone(), app_css.clone()], |request| async move {
        if request.url.path().ends_with(".js") {
          ok("js v2")
        } else {
          ok("css v2")
        }
      })
      .await
      .unwrap();
    assert_eq!(installed, 2);

    // staged entries stay invisible until activation
    let before = cache.handle(&app_js, || async { offline() }).await.unwrap();
    assert_eq!(before.data.body, b"js v1");

    assert_eq!(cache.activate("v2").unwrap(), 2);
    let js = cache.handle(&app_js, || async { offline() }).await.unwrap();
    let css = cache.handle(&app_css, || async { offline() }).await.unwrap();
    assert_eq!(js.data.body, b"js v2");
    assert_eq!(css.data.body, b"css v2");
    assert_eq!(
      cache.storage().generations().unwrap(),
      vec![("v2".to_string(), 2)]
    );
  }

  #[tokio::test]
  async fn test_generation_is_restored_from_storage() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage.activate("v7").unwrap();
    let cache = CacheLayer::new(
      storage,
      RouteTable::from_config(&CacheConfig::default()),
      "v1",
    )
    .unwrap();
    assert_eq!(cache.generation().unwrap(), "v7");
  }

  #[tokio::test]
  async fn test_purge_stale_keeps_current_generation() {
    let cache = layer();
    let request = CacheRequest::get(url("/static/app.js"));
    cache.handle(&request, || async { ok("js") }).await.unwrap();
    cache
      .install("v2", &[request.clone()], |_| async { ok("js v2") })
      .await
      .unwrap();

    // v2 was installed but never activated
    assert_eq!(cache.purge_stale().unwrap(), 1);
    let served = cache.handle(&request, || async { offline() }).await.unwrap();
    assert_eq!(served.data.body, b"js");
  }
}
