use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conflict::ConflictStrategy;
use crate::engine::SyncSettings;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  /// Directory holding emosync.db (defaults to the platform data directory)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub conflict: ConflictConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_hours: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_hours: 24,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  /// Upper bound on operations delivered by one sync pass
  pub max_operations_per_sync: usize,
  /// Upper bound on remote records applied by one pull
  pub max_records_per_pull: usize,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 1000,
      max_delay_ms: 30_000,
      max_operations_per_sync: 100,
      max_records_per_pull: 100,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
  /// Strategy used when the user has not stored a preference
  pub strategy: ConflictStrategy,
  /// Applied when a manual resolution is cancelled or abandoned
  pub cancel_fallback: ConflictStrategy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when EMOSYNC_LOG is unset
  pub level: String,
  /// Write a daily rolling log file here in addition to stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file, falling back to defaults.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./emosync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/emosync/config.yaml
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
    // Check current directory
    let local = PathBuf::from("emosync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("emosync").join("config.yaml");
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

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.check()?;
    Ok(config)
  }

  fn check(&self) -> Result<()> {
    if self.cache.default_ttl_hours == 0 {
      return Err(eyre!("cache.default_ttl_hours must be positive"));
    }
    if self.queue.base_delay_ms > self.queue.max_delay_ms {
      return Err(eyre!("queue.base_delay_ms must not exceed queue.max_delay_ms"));
    }
    if self.queue.max_operations_per_sync == 0 {
      return Err(eyre!("queue.max_operations_per_sync must be positive"));
    }
    if self.queue.max_records_per_pull == 0 {
      return Err(eyre!("queue.max_records_per_pull must be positive"));
    }
    if self.conflict.cancel_fallback == ConflictStrategy::Manual {
      return Err(eyre!("conflict.cancel_fallback cannot be manual"));
    }
    Ok(())
  }

  /// Engine settings derived from this configuration.
  pub fn sync_settings(&self) -> SyncSettings {
    SyncSettings {
      default_ttl: chrono::Duration::hours(self.cache.default_ttl_hours as i64),
      retry: RetryPolicy {
        max_retries: self.queue.max_retries,
        base_delay: Duration::from_millis(self.queue.base_delay_ms),
        max_delay: Duration::from_millis(self.queue.max_delay_ms),
      },
      max_operations_per_sync: self.queue.max_operations_per_sync,
      max_records_per_pull: self.queue.max_records_per_pull,
      conflict_strategy: self.conflict.strategy,
      cancel_fallback: self.conflict.cancel_fallback,
    }
  }
}
