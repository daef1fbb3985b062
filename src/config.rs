use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use url::Url;

use crate::cache::{CacheRegion, RegionSet};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application name, first part of every region name
  pub app: String,
  /// Cache generation; bumping it drops all regions of the previous one on activation
  pub version: String,
  /// Base URL that relative request paths resolve against
  pub origin: String,
  /// Pre-fetched at install; entries ending in `/` also match as path prefixes
  pub static_assets: Vec<String>,
  /// Path fragments of bundled runtime files
  pub runtime_assets: Vec<String>,
  pub api_patterns: Vec<String>,
  pub image_extensions: Vec<String>,
  pub data_segments: Vec<String>,
  pub regions: RegionsConfig,
  pub network: NetworkConfig,
  pub cache: CacheConfig,
  pub queue: QueueConfig,
  pub backend: BackendConfig,
  pub intervals: IntervalsConfig,
  /// Activate right after a successful install instead of waiting for SKIP_WAITING
  pub skip_waiting: bool,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegionsConfig {
  #[serde(rename = "static")]
  pub static_region: RegionOverride,
  pub dynamic: RegionOverride,
  pub data: RegionOverride,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegionOverride {
  pub expiry_secs: Option<u64>,
  pub byte_budget: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false every lookup misses and nothing is stored
  pub enabled: bool,
  /// Defaults to $XDG_DATA_HOME/offline-cache/cache.db
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Defaults to $XDG_DATA_HOME/offline-cache/queue.db
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Defaults to `origin`
  pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
  pub sweep_secs: u64,
  pub drain_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
  /// `EnvFilter` directives; `RUST_LOG` wins when set
  pub filter: Option<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app: "everydiary".to_string(),
      version: "v2.0.0".to_string(),
      origin: "http://localhost:8080/".to_string(),
      static_assets: strings(&[
        "/",
        "/index.html",
        "/manifest.json",
        "/favicon.png",
        "/icons/Icon-192.png",
        "/icons/Icon-512.png",
        "/icons/Icon-maskable-192.png",
        "/icons/Icon-maskable-512.png",
        "/icons/Icon-72.png",
        "/icons/Icon-96.png",
        "/icons/Icon-144.png",
        "/icons/Icon-384.png",
        "/splash.html",
        "/flutter_bootstrap.js",
        "/flutter.js",
        "/canvaskit/",
        "/assets/",
      ]),
      runtime_assets: strings(&["/assets/", "/canvaskit/", "/flutter.js", "/flutter_bootstrap.js"]),
      api_patterns: strings(&["/api/", "/supabase/", "/firebase/"]),
      image_extensions: strings(&["jpg", "jpeg", "png", "gif", "webp", "svg"]),
      data_segments: strings(&["/data/", "/user/", "/diary/"]),
      regions: RegionsConfig::default(),
      network: NetworkConfig::default(),
      cache: CacheConfig::default(),
      queue: QueueConfig::default(),
      backend: BackendConfig::default(),
      intervals: IntervalsConfig::default(),
      skip_waiting: true,
      log: LogConfig::default(),
    }
  }
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      database: None,
    }
  }
}

impl Default for IntervalsConfig {
  fn default() -> Self {
    Self {
      sweep_secs: 60 * 60,
      drain_secs: 60,
    }
  }
}

fn strings(values: &[&str]) -> Vec<String> {
  values.iter().map(|s| s.to_string()).collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-cache/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-cache").join("config.yaml");
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
    // An empty document deserializes to unit, not to a map
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// The three regions of the configured generation, overrides applied.
  pub fn region_set(&self) -> RegionSet {
    let mut regions = RegionSet::new(&self.app, &self.version);

    for (region, overrides) in [
      (CacheRegion::Static, &self.regions.static_region),
      (CacheRegion::Dynamic, &self.regions.dynamic),
      (CacheRegion::Data, &self.regions.data),
    ] {
      let policy = regions.get_mut(region);
      if let Some(secs) = overrides.expiry_secs {
        policy.expiry = Duration::seconds(secs as i64);
      }
      if let Some(budget) = overrides.byte_budget {
        policy.byte_budget = budget;
      }
    }

    regions
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn backend_url(&self) -> Result<Url> {
    match &self.backend.base_url {
      Some(base) => Url::parse(base).map_err(|e| eyre!("Invalid backend URL '{}': {}", base, e)),
      None => self.origin_url(),
    }
  }

  /// Install manifest resolved against the origin.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    let origin = self.origin_url()?;
    self
      .static_assets
      .iter()
      .map(|asset| {
        origin
          .join(asset)
          .map_err(|e| eyre!("Invalid static asset '{}': {}", asset, e))
      })
      .collect()
  }

  pub fn network_timeout(&self) -> StdDuration {
    StdDuration::from_secs(self.network.timeout_secs)
  }

  /// Get the backend API token from environment variables.
  ///
  /// Reads OFFLINE_CACHE_API_TOKEN; replay runs unauthenticated without it.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OFFLINE_CACHE_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
