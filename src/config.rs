use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use offsync::{ClientOptions, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  /// Endpoint hit once at start-up to decide whether we are online
  #[serde(default = "default_ping_endpoint")]
  pub ping_endpoint: String,
  /// Extra headers sent with every request
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_max_age_ms")]
  pub default_max_age_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_max_age_ms: default_max_age_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_retry_attempts")]
  pub attempts: u32,
  #[serde(default = "default_retry_delay_ms")]
  pub delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      attempts: default_retry_attempts(),
      delay_ms: default_retry_delay_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// Replay pending operations whenever we start online
  #[serde(default)]
  pub auto_drain_on_reconnect: bool,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      auto_drain_on_reconnect: false,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file (default: $XDG_DATA_HOME/offsync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Daily-rolling log file, in addition to stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: None,
    }
  }
}

fn default_timeout_ms() -> u64 {
  15_000
}

fn default_ping_endpoint() -> String {
  "/public/ping".to_string()
}

fn default_max_age_ms() -> u64 {
  24 * 60 * 60 * 1000
}

fn default_retry_attempts() -> u32 {
  3
}

fn default_retry_delay_ms() -> u64 {
  1000
}

fn default_max_attempts() -> u32 {
  3
}

fn default_log_level() -> String {
  "warn".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offsync/config.yaml\n\
                 with at least `api: {{ base_url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
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

  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the API token from the environment, if any.
  ///
  /// Checks OFFSYNC_API_TOKEN. Obtaining or refreshing it is up to the host.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OFFSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  /// Configured headers plus a bearer token when one is available.
  pub fn request_headers(&self, token: Option<&str>) -> BTreeMap<String, String> {
    let mut headers = self.api.headers.clone();
    if let Some(token) = token {
      headers.insert("Authorization".to_string(), format!("Bearer {}", token));
    }
    headers
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.api.timeout_ms)
  }

  pub fn client_options(&self) -> ClientOptions {
    ClientOptions {
      retry: RetryPolicy {
        attempts: self.retry.attempts.max(1),
        delay: Duration::from_millis(self.retry.delay_ms),
      },
      default_max_age: Duration::from_millis(self.cache.default_max_age_ms),
      max_attempts: self.queue.max_attempts.max(1),
      auto_drain_on_reconnect: self.queue.auto_drain_on_reconnect,
    }
  }
}
