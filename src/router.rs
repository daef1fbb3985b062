//! Request classification: which strategy and region answer a given URL.

use url::Url;

use crate::cache::{CacheRegion, Request};
use crate::config::Config;

/// URL shape of an intercepted request, in matching priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCategory {
  /// Manifest entry or bundled runtime file
  StaticAsset,
  /// Backend call
  Api,
  Image,
  /// Path with a data/user/diary segment
  DomainData,
  /// Nothing matched
  Other,
}

/// Fetch strategy selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

/// Where a request is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
  pub category: RequestCategory,
  pub strategy: Strategy,
  pub region: CacheRegion,
}

impl RequestCategory {
  pub fn route(self) -> Route {
    let (strategy, region) = match self {
      Self::StaticAsset => (Strategy::CacheFirst, CacheRegion::Static),
      Self::Api => (Strategy::NetworkFirst, CacheRegion::Dynamic),
      Self::Image => (Strategy::StaleWhileRevalidate, CacheRegion::Dynamic),
      Self::DomainData => (Strategy::CacheFirst, CacheRegion::Data),
      Self::Other => (Strategy::NetworkFirst, CacheRegion::Dynamic),
    };

    Route {
      category: self,
      strategy,
      region,
    }
  }
}

/// Matching rules for classification.
#[derive(Debug, Clone)]
pub struct Router {
  /// Manifest paths; entries ending in `/` match as prefixes
  static_assets: Vec<String>,
  /// Path fragments that mark bundled runtime assets
  runtime_assets: Vec<String>,
  api_patterns: Vec<String>,
  /// Lowercase, without the dot
  image_extensions: Vec<String>,
  data_segments: Vec<String>,
}

impl Router {
  pub fn new(
    static_assets: Vec<String>,
    runtime_assets: Vec<String>,
    api_patterns: Vec<String>,
    image_extensions: Vec<String>,
    data_segments: Vec<String>,
  ) -> Self {
    Self {
      static_assets,
      runtime_assets,
      api_patterns,
      image_extensions: image_extensions
        .into_iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect(),
      data_segments,
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(
      config.static_assets.clone(),
      config.runtime_assets.clone(),
      config.api_patterns.clone(),
      config.image_extensions.clone(),
      config.data_segments.clone(),
    )
  }

  /// Route for a request, or `None` when it is not intercepted (non-GET).
  pub fn route(&self, request: &Request) -> Option<Route> {
    if !request.is_get() {
      return None;
    }
    Some(self.classify(request.url.as_str()).route())
  }

  /// Classify a URL. First matching predicate wins; never fails.
  ///
  /// Accepts absolute URLs or bare paths.
  pub fn classify(&self, url: &str) -> RequestCategory {
    let path = match Url::parse(url) {
      Ok(parsed) => parsed.path().to_string(),
      Err(_) => url.split(&['?', '#'][..]).next().unwrap_or(url).to_string(),
    };

    if self.is_static_asset(&path) {
      RequestCategory::StaticAsset
    } else if self.api_patterns.iter().any(|p| url.contains(p.as_str())) {
      RequestCategory::Api
    } else if self.is_image(&path) {
      RequestCategory::Image
    } else if self.data_segments.iter().any(|s| url.contains(s.as_str())) {
      RequestCategory::DomainData
    } else {
      RequestCategory::Other
    }
  }

  fn is_static_asset(&self, path: &str) -> bool {
    let in_manifest = self.static_assets.iter().any(|asset| {
      if asset.len() > 1 && asset.ends_with('/') {
        path.starts_with(asset.as_str())
      } else {
        path == asset
      }
    });

    in_manifest || self.runtime_assets.iter().any(|r| path.contains(r.as_str()))
  }

  fn is_image(&self, path: &str) -> bool {
    let Some((_, extension)) = path.rsplit_once('.') else {
      return false;
    };
    if extension.contains('/') {
      return false;
    }
    let extension = extension.to_lowercase();
    self.image_extensions.iter().any(|e| *e == extension)
  }
}

impl Default for Router {
  fn default() -> Self {
    Self::from_config(&Config::default())
  }
}
