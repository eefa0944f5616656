use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::CacheTuning;
use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the hosted backend project.
  pub url: String,
  /// Public API key sent with every request; row-level security does the
  /// actual scoping.
  pub anon_key: String,
}

/// Freshness windows, in whole seconds to keep the YAML plain.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_after_secs: u64,
  pub expire_after_secs: u64,
  pub sweep_interval_secs: u64,
  pub refresh_after_mutation: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_after_secs: 120,
      expire_after_secs: 1800,
      sweep_interval_secs: 300,
      refresh_after_mutation: true,
    }
  }
}

impl CacheConfig {
  pub fn tuning(&self) -> CacheTuning {
    CacheTuning {
      stale_after: chrono::Duration::seconds(self.stale_after_secs as i64),
      expire_after: chrono::Duration::seconds(self.expire_after_secs as i64),
      refresh_after_mutation: self.refresh_after_mutation,
    }
  }

  pub fn sweep_interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.sweep_interval_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./agora.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/agora/config.yaml
  /// 4. ~/.config/agora/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(ConfigError::NotFound(p.to_path_buf()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(ConfigError::Missing),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("agora.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("agora").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
      path: path.to_path_buf(),
      source: e,
    })?;

    Self::from_yaml(&contents).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      source: e,
    })
  }

  fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the signed-in user's access token from the environment.
  ///
  /// The auth flow lives outside this crate; it hands the token over via
  /// AGORA_ACCESS_TOKEN.
  pub fn get_access_token() -> Result<String, ConfigError> {
    std::env::var("AGORA_ACCESS_TOKEN").map_err(|_| ConfigError::MissingToken)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cache_block_is_optional_and_defaulted() {
    let config = Config::from_yaml(
      "backend:\n  url: https://backend.example.com\n  anon_key: anon\n",
    )
    .unwrap();
    assert_eq!(config.cache.stale_after_secs, 120);
    assert_eq!(config.cache.sweep_interval_secs, 300);
    assert!(config.cache.refresh_after_mutation);
  }

  #[test]
  fn cache_overrides_parse_into_tuning() {
    let config = Config::from_yaml(
      "backend:\n  url: https://backend.example.com\n  anon_key: anon\ncache:\n  stale_after_secs: 60\n  expire_after_secs: 600\n  sweep_interval_secs: 120\n  refresh_after_mutation: false\n",
    )
    .unwrap();
    let tuning = config.cache.tuning();
    assert_eq!(tuning.stale_after, chrono::Duration::seconds(60));
    assert_eq!(tuning.expire_after, chrono::Duration::seconds(600));
    assert!(!tuning.refresh_after_mutation);
    assert_eq!(config.cache.sweep_interval(), std::time::Duration::from_secs(120));
  }
}
