use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
  pub cache: CacheConfig,
  pub capture: CaptureConfig,
  pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Base URL of the project-management server
  pub url: String,
  /// Path prefix for queued mutations; the action name is appended
  pub sync_path: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:3000".to_string(),
      sync_path: "/api/offline-sync".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Failed attempts after which an item waits for manual retry
  pub max_retries: u32,
  pub handler_timeout_secs: u64,
  pub backoff_base_secs: u64,
  pub backoff_max_secs: u64,
  pub permanent_status: StatusPolicy,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      handler_timeout_secs: 30,
      backoff_base_secs: 2,
      backoff_max_secs: 60,
      permanent_status: StatusPolicy::default(),
    }
  }
}

impl SyncConfig {
  pub fn handler_timeout(&self) -> Duration {
    Duration::from_secs(self.handler_timeout_secs)
  }

  /// Delay before the `attempt`-th follow-up drain (1-based), doubling and capped.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let secs = self.backoff_base_secs.saturating_mul(1u64 << exp);
    Duration::from_secs(secs.min(self.backoff_max_secs))
  }
}

/// Which HTTP statuses count as a permanent rejection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatusPolicy {
  pub from: u16,
  pub to: u16,
  /// Statuses inside the range that are still worth retrying
  pub retryable_exceptions: Vec<u16>,
}

impl Default for StatusPolicy {
  fn default() -> Self {
    Self {
      from: 400,
      to: 499,
      retryable_exceptions: vec![408, 429],
    }
  }
}

impl StatusPolicy {
  pub fn is_permanent(&self, status: u16) -> bool {
    (self.from..=self.to).contains(&status) && !self.retryable_exceptions.contains(&status)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// host:port probed for connectivity (defaults to the server's address)
  pub probe_addr: Option<String>,
  pub probe_interval_secs: u64,
  pub probe_timeout_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_addr: None,
      probe_interval_secs: 5,
      probe_timeout_ms: 1500,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Generation tag of the deployed client build
  pub generation: String,
  /// URL patterns served cache-first (prefix `/x/` or suffix `*.ext`)
  pub cache_first: Vec<String>,
  /// URL patterns that always go to the network
  pub pass_through: Vec<String>,
  /// URLs fetched into a new generation before it is activated
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      generation: "v1".to_string(),
      cache_first: [
        "/_next/static/",
        "/static/",
        "/icons/",
        "*.js",
        "*.css",
        "*.woff2",
        "*.png",
        "*.svg",
        "*.ico",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      pass_through: ["/api/", "/auth/"].into_iter().map(String::from).collect(),
      precache: vec!["/".to_string(), "/offline".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
  pub max_duration_secs: u64,
  pub sample_rate: u32,
}

impl Default for CaptureConfig {
  fn default() -> Self {
    Self {
      max_duration_secs: 120,
      sample_rate: 16_000,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Directory for the queue and cache databases
  pub data_dir: Option<PathBuf>,
  /// Refuse to enqueue beyond this many items
  pub max_items: Option<usize>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  ///
  /// With no file found the defaults apply, so the tool works offline
  /// without any setup.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Directory holding the queue database, cache database, and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.store.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fieldsync"))
  }

  /// Address probed by the network monitor.
  pub fn probe_addr(&self) -> Result<String> {
    if let Some(addr) = &self.network.probe_addr {
      return Ok(addr.clone());
    }

    let url = url::Url::parse(&self.server.url)
      .map_err(|e| eyre!("Invalid server url {}: {}", self.server.url, e))?;
    let host = url
      .host_str()
      .ok_or_else(|| eyre!("Server url {} has no host", self.server.url))?;
    let port = url
      .port_or_known_default()
      .ok_or_else(|| eyre!("Server url {} has no port", self.server.url))?;
    Ok(format!("{host}:{port}"))
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// Checks FIELDSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FIELDSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_without_file() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.sync.handler_timeout(), Duration::from_secs(30));
    assert_eq!(config.capture.max_duration_secs, 120);
    assert!(config.cache.pass_through.contains(&"/api/".to_string()));
  }

  #[test]
  fn test_partial_yaml_overrides() {
    let config = Config::from_yaml(
      r#"
server:
  url: https://pm.example.com
sync:
  max_retries: 5
  permanent_status:
    from: 400
    to: 451
    retryable_exceptions: [409]
cache:
  generation: "2024-06-01"
store:
  max_items: 500
"#,
    )
    .unwrap();

    assert_eq!(config.server.url, "https://pm.example.com");
    assert_eq!(config.server.sync_path, "/api/offline-sync");
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.sync.handler_timeout_secs, 30);
    assert!(config.sync.permanent_status.is_permanent(422));
    assert!(!config.sync.permanent_status.is_permanent(409));
    assert!(!config.sync.permanent_status.is_permanent(499));
    assert_eq!(config.cache.generation, "2024-06-01");
    assert_eq!(config.store.max_items, Some(500));
  }

  #[test]
  fn test_default_status_policy() {
    let policy = StatusPolicy::default();
    assert!(policy.is_permanent(400));
    assert!(policy.is_permanent(422));
    assert!(!policy.is_permanent(408));
    assert!(!policy.is_permanent(429));
    assert!(!policy.is_permanent(500));
    assert!(!policy.is_permanent(503));
  }

  #[test]
  fn test_backoff_doubles_and_caps() {
    let sync = SyncConfig::default();
    assert_eq!(sync.backoff(1), Duration::from_secs(2));
    assert_eq!(sync.backoff(2), Duration::from_secs(4));
    assert_eq!(sync.backoff(3), Duration::from_secs(8));
    assert_eq!(sync.backoff(10), Duration::from_secs(60));
  }

  #[test]
  fn test_probe_addr_from_server_url() {
    let mut config = Config::default();
    config.server.url = "https://pm.example.com/app".to_string();
    assert_eq!(config.probe_addr().unwrap(), "pm.example.com:443");

    config.network.probe_addr = Some("10.0.0.1:8080".to_string());
    assert_eq!(config.probe_addr().unwrap(), "10.0.0.1:8080");
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/fieldsync.yaml"))).is_err());
  }
}
