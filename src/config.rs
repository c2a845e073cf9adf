use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL that relative request paths resolve against
  #[serde(default = "default_origin")]
  pub origin: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version label of the current deployment (e.g. "v3.2.1")
  pub version: String,
  /// Prefix for the asset namespace; the full name is `<prefix>-<version>`
  pub asset_prefix: String,
  /// Name of the API response namespace
  pub api_namespace: String,
  /// Paths seeded on install and always served cache-first
  pub critical_assets: Vec<String>,
  /// Path prefixes routed network-first into the API namespace
  pub api_endpoints: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v3.2.1".to_string(),
      asset_prefix: "armffsoft".to_string(),
      api_namespace: "armffsoft-api-v1".to_string(),
      critical_assets: vec![
        "/".to_string(),
        "/css/critical.css".to_string(),
        "/js/runtime.js".to_string(),
        "/fonts/Geist-Bold.woff2".to_string(),
        "/manifest.json".to_string(),
      ],
      api_endpoints: vec![
        "/api/products".to_string(),
        "/api/user/profile".to_string(),
        "/api/orders".to_string(),
      ],
    }
  }
}

impl CacheConfig {
  /// Namespace holding the assets of the current deployment.
  pub fn asset_namespace(&self) -> String {
    format!("{}-{}", self.asset_prefix, self.version)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-request timeout; an expired timeout counts as a network failure
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Trigger topic that drains the retry queue
  pub topic: String,
  /// Path queued payloads are POSTed to
  pub endpoint: String,
  /// Interval between connectivity probes in `watch` mode
  pub interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      topic: "background-payment".to_string(),
      endpoint: "/api/payments/process".to_string(),
      interval_secs: 30,
    }
  }
}

fn default_origin() -> String {
  "http://localhost:8080".to_string()
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      cache: CacheConfig::default(),
      network: NetworkConfig::default(),
      sync: SyncConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sfrelay.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sfrelay/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("SFRELAY_ORIGIN") {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("sfrelay.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sfrelay").join("config.yaml");
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

  fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    if self.cache.asset_namespace() == self.cache.api_namespace {
      return Err(eyre!(
        "Asset namespace and API namespace must differ (both are '{}')",
        self.cache.api_namespace
      ));
    }

    Ok(())
  }

  /// Resolve the data directory holding cache.db, queue.db and logs.
  pub fn data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
      return Ok(p.to_path_buf());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("sfrelay"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_deployment() {
    let config = Config::default();
    assert_eq!(config.cache.asset_namespace(), "armffsoft-v3.2.1");
    assert_eq!(config.cache.critical_assets.len(), 5);
    assert_eq!(config.sync.topic, "background-payment");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn partial_yaml_keeps_section_defaults() {
    let config = Config::from_yaml(
      r#"
origin: "https://shop.example"
cache:
  version: "v4.0.0"
sync:
  interval_secs: 5
"#,
    )
    .unwrap();

    assert_eq!(config.origin, "https://shop.example");
    assert_eq!(config.cache.asset_namespace(), "armffsoft-v4.0.0");
    assert_eq!(config.cache.api_endpoints.len(), 3);
    assert_eq!(config.sync.interval_secs, 5);
    assert_eq!(config.sync.endpoint, "/api/payments/process");
    assert_eq!(config.network.timeout_secs, 10);
  }

  #[test]
  fn colliding_namespaces_are_rejected() {
    let mut config = Config::default();
    config.cache.api_namespace = config.cache.asset_namespace();
    assert!(config.validate().is_err());
  }

  #[test]
  fn bad_origin_is_rejected() {
    let config = Config {
      origin: "not a url".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }
}
