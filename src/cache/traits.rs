//! Core types for the response cache: regions, requests, responses and results.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// A named partition of the cache with its own expiry and byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRegion {
  Static,
  Dynamic,
  Data,
}

impl CacheRegion {
  pub const ALL: [CacheRegion; 3] = [CacheRegion::Static, CacheRegion::Dynamic, CacheRegion::Data];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Data => "data",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "static" => Some(Self::Static),
      "dynamic" => Some(Self::Dynamic),
      "data" => Some(Self::Data),
      _ => None,
    }
  }

  /// How long an entry stays fresh unless its metadata says otherwise.
  pub fn default_expiry(&self) -> Duration {
    match self {
      Self::Static => Duration::days(7),
      Self::Dynamic => Duration::days(1),
      Self::Data => Duration::hours(1),
    }
  }

  pub fn default_byte_budget(&self) -> u64 {
    const MB: u64 = 1024 * 1024;
    match self {
      Self::Static => 30 * MB,
      Self::Dynamic => 15 * MB,
      Self::Data => 5 * MB,
    }
  }
}

/// Expiry and size policy for one region, plus its generation-qualified name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPolicy {
  pub region: CacheRegion,
  /// Stored name, e.g. `everydiary-static-v2.0.0`
  pub name: String,
  pub expiry: Duration,
  pub byte_budget: u64,
}

impl RegionPolicy {
  pub fn new(region: CacheRegion, name: String) -> Self {
    Self {
      region,
      name,
      expiry: region.default_expiry(),
      byte_budget: region.default_byte_budget(),
    }
  }

  pub fn with_byte_budget(mut self, byte_budget: u64) -> Self {
    self.byte_budget = byte_budget;
    self
  }
}

/// The three regions of one cache generation.
#[derive(Debug, Clone)]
pub struct RegionSet {
  app: String,
  version: String,
  policies: [RegionPolicy; 3],
}

impl RegionSet {
  pub fn new(app: &str, version: &str) -> Self {
    let policies = CacheRegion::ALL.map(|region| {
      RegionPolicy::new(region, Self::region_name(app, region, version))
    });

    Self {
      app: app.to_string(),
      version: version.to_string(),
      policies,
    }
  }

  /// Build a stored region name: `<app>-<region>-<version>`.
  pub fn region_name(app: &str, region: CacheRegion, version: &str) -> String {
    format!("{}-{}-{}", app, region.as_str(), version)
  }

  /// Recover the region category from a stored name.
  ///
  /// Works for names of any generation, so old regions can be classified
  /// before they are deleted.
  pub fn parse_region(name: &str) -> Option<CacheRegion> {
    name.split('-').find_map(CacheRegion::parse)
  }

  /// Cache generation identifier, reported to `GET_VERSION`.
  pub fn generation(&self) -> String {
    format!("{}-{}", self.app, self.version)
  }

  pub fn get(&self, region: CacheRegion) -> &RegionPolicy {
    &self.policies[Self::index(region)]
  }

  pub fn get_mut(&mut self, region: CacheRegion) -> &mut RegionPolicy {
    &mut self.policies[Self::index(region)]
  }

  pub fn iter(&self) -> impl Iterator<Item = &RegionPolicy> {
    self.policies.iter()
  }

  pub fn is_current(&self, name: &str) -> bool {
    self.policies.iter().any(|p| p.name == name)
  }

  fn index(region: CacheRegion) -> usize {
    match region {
      CacheRegion::Static => 0,
      CacheRegion::Dynamic => 1,
      CacheRegion::Data => 2,
    }
  }
}

/// An intercepted request. Only the method and URL matter to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
    }
  }

  pub fn get(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::new("GET", url))
  }

  /// Resolve a possibly relative URL against the application origin.
  pub fn resolve(method: &str, origin: &Url, url: &str) -> Result<Self> {
    let url = origin
      .join(url)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::new(method, url))
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  pub fn identity(&self) -> RequestIdentity {
    RequestIdentity::of(self)
  }
}

/// Canonical cache key for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  /// SHA256 of the description, fixed length for storage
  pub key: String,
  /// Human readable form, e.g. `GET https://host/path`
  pub description: String,
}

impl RequestIdentity {
  pub fn of(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    let description = format!("{} {}", request.method, url);

    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    let key = hex::encode(hasher.finalize());

    Self { key, description }
  }
}

/// Response payload as stored and returned by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// The fixed response used when neither network nor a fresh cache entry can answer.
  pub fn offline() -> Self {
    Self::new(503, "Offline")
  }

  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn size_bytes(&self) -> u64 {
    self.body.len() as u64
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }
}

impl CacheResult<HttpResponse> {
  /// Neither network nor cache could answer.
  pub fn unavailable() -> Self {
    Self {
      data: HttpResponse::offline(),
      source: CacheSource::Unavailable,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache served without a freshness check, refresh running in background
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Network unavailable and nothing usable cached; synthetic 503
  Unavailable,
}
