use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_MAX_ENTRIES;
use crate::query::{QueryOptions, RetryPolicy};
use crate::transport::DEFAULT_TIMEOUT;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub query: QueryConfig,
  /// Log file path, or `stderr` (defaults to ims.log in the data directory)
  pub log_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_BASE_URL.to_string(),
      timeout_secs: DEFAULT_TIMEOUT.as_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  /// How long fetched data is served without asking the server again
  pub freshness_secs: u64,
  /// How long unused data is kept around
  pub retention_secs: u64,
  pub max_retries: u32,
  pub max_entries: usize,
  pub page_size: u32,
  pub refetch_on_focus: bool,
  pub refetch_on_reconnect: bool,
  pub refetch_on_mount: bool,
}

impl Default for QueryConfig {
  fn default() -> Self {
    let options = QueryOptions::default();
    Self {
      freshness_secs: options.freshness_window.as_secs(),
      retention_secs: options.retention_window.as_secs(),
      max_retries: options.retry.max_retries,
      max_entries: DEFAULT_MAX_ENTRIES,
      page_size: 20,
      refetch_on_focus: options.refetch_on_focus,
      refetch_on_reconnect: options.refetch_on_reconnect,
      refetch_on_mount: options.refetch_on_mount,
    }
  }
}

impl QueryConfig {
  pub fn options(&self) -> QueryOptions {
    QueryOptions::default()
      .with_freshness_window(Duration::from_secs(self.freshness_secs))
      .with_retention_window(Duration::from_secs(self.retention_secs))
      .with_retry(RetryPolicy::new(self.max_retries))
      .with_refetch_on_focus(self.refetch_on_focus)
      .with_refetch_on_reconnect(self.refetch_on_reconnect)
      .with_refetch_on_mount(self.refetch_on_mount)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ims.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ims/config.yaml
  ///
  /// Falls back to defaults when no file exists. `IMS_API_URL` overrides the
  /// configured base URL either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var("IMS_API_URL") {
      config.api.base_url = url;
    }
    config.validate()?;
    Ok(config)
  }

  /// Reject values that parse but can't work.
  pub fn validate(&self) -> Result<()> {
    if self.api.timeout_secs == 0 {
      return Err(eyre!("api.timeout_secs must be at least 1"));
    }
    Ok(())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ims.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ims").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config.
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the login password from environment variables.
  ///
  /// Checks IMS_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("IMS_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set the IMS_PASSWORD environment variable."))
  }
}
