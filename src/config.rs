use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub heartbeat: HeartbeatConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub offline: OfflineConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
  /// Portal API root, used for replaying queued writes
  pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
  /// Liveness endpoint (defaults to the API base URL)
  pub url: Option<String>,
  pub interval_secs: u64,
  pub timeout_secs: u64,
  /// How often the network interface is polled for reachability
  pub poll_secs: u64,
}

impl Default for HeartbeatConfig {
  fn default() -> Self {
    Self {
      url: None,
      interval_secs: 60,
      timeout_secs: 10,
      poll_secs: 15,
    }
  }
}

impl HeartbeatConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs.max(1))
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_minutes: u64,
  /// Upper bound on in-memory entries (unbounded if not set)
  pub memory_max_entries: Option<usize>,
  /// SQLite database file (defaults to the platform data directory)
  pub db_path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_minutes: 10,
      memory_max_entries: None,
      db_path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// How long the force-offline setting is cached
  pub flag_ttl_secs: u64,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self { flag_ttl_secs: 60 }
  }
}

impl OfflineConfig {
  pub fn flag_ttl(&self) -> Duration {
    Duration::from_secs(self.flag_ttl_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./satchel.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/satchel/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("satchel.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("satchel").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if let Some(url) = &self.api.base_url {
      parse_http_url(url)?;
    }
    if let Some(url) = &self.heartbeat.url {
      parse_http_url(url)?;
    }
    Ok(())
  }

  pub fn api_base_url(&self) -> Result<Option<Url>> {
    self.api.base_url.as_deref().map(parse_http_url).transpose()
  }

  /// Heartbeat endpoint, falling back to the API base URL.
  pub fn heartbeat_url(&self) -> Result<Option<Url>> {
    match &self.heartbeat.url {
      Some(url) => parse_http_url(url).map(Some),
      None => self.api_base_url(),
    }
  }

  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.default_ttl_minutes.saturating_mul(60))
  }
}

fn parse_http_url(raw: &str) -> Result<Url> {
  let url = Url::parse(raw).map_err(|e| eyre!("Invalid URL {:?}: {}", raw, e))?;
  match url.scheme() {
    "http" | "https" => Ok(url),
    other => Err(eyre!("Unsupported URL scheme {:?} in {:?}", other, raw)),
  }
}
