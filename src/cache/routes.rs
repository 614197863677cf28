//! Static classification of requests into caching strategies.

use reqwest::Method;

use super::traits::CacheRequest;
use crate::config::CacheConfig;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Static assets: cache if present, otherwise fetch and store
  CacheFirst,
  /// Pages and data: network, falling back to cache, then a placeholder
  NetworkFirst,
  /// Mutations and dynamic endpoints: never cached, never served stale
  PassThrough,
}

/// A URL path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
  /// `/static/` matches paths starting with it
  Prefix(String),
  /// `*.js` matches paths ending with `.js`
  Suffix(String),
}

impl Pattern {
  pub fn parse(raw: &str) -> Self {
    match raw.strip_prefix('*') {
      Some(suffix) => Pattern::Suffix(suffix.to_string()),
      None => Pattern::Prefix(raw.to_string()),
    }
  }

  pub fn matches(&self, path: &str) -> bool {
    match self {
      Pattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
      Pattern::Suffix(suffix) => path.ends_with(suffix.as_str()),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
  cache_first: Vec<Pattern>,
  pass_through: Vec<Pattern>,
}

impl RouteTable {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      cache_first: config.cache_first.iter().map(|p| Pattern::parse(p)).collect(),
      pass_through: config.pass_through.iter().map(|p| Pattern::parse(p)).collect(),
    }
  }

  /// Pass-through rules win over cache-first ones; anything else is
  /// network-first.
  pub fn classify(&self, request: &CacheRequest) -> Strategy {
    if request.method != Method::GET {
      return Strategy::PassThrough;
    }

    let path = request.url.path();
    if self.pass_through.iter().any(|p| p.matches(path)) {
      Strategy::PassThrough
    } else if self.cache_first.iter().any(|p| p.matches(path)) {
      Strategy::CacheFirst
    } else {
      Strategy::NetworkFirst
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn request(path: &str) -> CacheRequest {
    CacheRequest::get(Url::parse("https://pm.example.com").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_default_table() {
    let routes = RouteTable::from_config(&CacheConfig::default());

    assert_eq!(
      routes.classify(&request("/_next/static/chunks/main-abc123.js")),
      Strategy::CacheFirst
    );
    assert_eq!(routes.classify(&request("/logo.svg")), Strategy::CacheFirst);
    assert_eq!(routes.classify(&request("/projects/12")), Strategy::NetworkFirst);
    assert_eq!(routes.classify(&request("/")), Strategy::NetworkFirst);
    assert_eq!(
      routes.classify(&request("/api/phases/3")),
      Strategy::PassThrough
    );
    // a script served from the api prefix is still dynamic
    assert_eq!(
      routes.classify(&request("/api/export.js")),
      Strategy::PassThrough
    );
  }

  #[test]
  fn test_mutations_pass_through() {
    let routes = RouteTable::from_config(&CacheConfig::default());
    let post = request("/static/app.css").with_method(Method::POST);
    assert_eq!(routes.classify(&post), Strategy::PassThrough);
  }

  #[test]
  fn test_query_string_is_ignored_for_matching() {
    let routes = RouteTable::from_config(&CacheConfig::default());
    assert_eq!(
      routes.classify(&request("/styles/site.css?v=42")),
      Strategy::CacheFirst
    );
  }
}
