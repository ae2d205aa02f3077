use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the care API, e.g. "https://api.example.com/v1/"
  pub url: String,
  /// Per-request timeout. Exceeding it counts as a retryable failure.
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// How long a fetched record is served without going back to the server
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Sends allowed per queued write before it is given up as failed
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file for cached records and queued writes (defaults to the data dir)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
  /// Directory for rolling log files (defaults to the data dir)
  pub directory: Option<PathBuf>,
  /// Filter directive used when CARELINE_LOG is not set
  pub filter: Option<String>,
}

fn default_timeout_secs() -> u64 {
  15
}

/// Largest TTL a `chrono::Duration` can hold.
const MAX_TTL_SECS: u64 = (i64::MAX / 1000) as u64;

fn default_ttl_secs() -> u64 {
  5 * 60
}

fn default_max_attempts() -> u32 {
  5
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./careline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/careline/config.yaml
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
        "No configuration file found. Create one at ~/.config/careline/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("careline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("careline").join("config.yaml");
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

  /// Parse configuration from a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.queue.max_attempts == 0 {
      return Err(eyre!("queue.max_attempts must be at least 1"));
    }
    if config.cache.ttl_secs > MAX_TTL_SECS {
      return Err(eyre!("cache.ttl_secs must be at most {}", MAX_TTL_SECS));
    }
    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks CARELINE_API_TOKEN.
  pub fn get_api_token() -> Result<String> {
    std::env::var("CARELINE_API_TOKEN")
      .map_err(|_| eyre!("API token not found. Set CARELINE_API_TOKEN environment variable."))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.remote.timeout_secs)
  }

  pub fn cache_ttl(&self) -> chrono::Duration {
    let secs = self.cache.ttl_secs.min(MAX_TTL_SECS);
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
  }

  /// Directory under the platform data dir that holds the store and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("careline"))
  }
}
