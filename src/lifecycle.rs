//! Installation, activation and control messages.
//!
//! Installing → Installed → Activating → Running. Installation pre-fetches
//! the static manifest; activation drops regions of older generations and
//! runs one eviction sweep. Only a running layer intercepts requests.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheRegion, CacheStorage, RegionSet, Request, SweepReport};
use crate::net::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Constructed, install not started
  New,
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activating,
  /// Intercepting requests
  Running,
}

/// Inbound control message, e.g. `{"type": "SKIP_WAITING"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate now instead of waiting for the previous instance to hand over
  SkipWaiting,
  GetVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionReply {
  pub version: String,
}

pub struct Lifecycle {
  state: Mutex<LifecycleState>,
  generation: String,
  manifest: Vec<Url>,
  skip_waiting: bool,
}

impl Lifecycle {
  pub fn new(generation: String, manifest: Vec<Url>, skip_waiting: bool) -> Self {
    Self {
      state: Mutex::new(LifecycleState::New),
      generation,
      manifest,
      skip_waiting,
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn is_running(&self) -> bool {
    self.state() == LifecycleState::Running
  }

  /// Cache generation identifier.
  pub fn version(&self) -> &str {
    &self.generation
  }

  fn set_state(&self, state: LifecycleState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Move `from` → `to` atomically; fails if the current state is not in `from`.
  fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> Result<()> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if !from.contains(&state) {
      return Err(eyre!("Cannot move from {:?} to {:?}", *state, to));
    }
    *state = to;
    Ok(())
  }

  /// Pre-populate the static region from the manifest.
  ///
  /// Every manifest URL is fetched before anything is written. When any
  /// fetch fails nothing is stored, the failure is logged and the controller
  /// still moves to Installed so activation can proceed with an empty static
  /// region. Auto skip-waiting only follows a complete install.
  pub async fn install<S, N>(&self, layer: &CacheLayer<S, N>) -> Result<usize>
  where
    S: CacheStorage + ?Sized + 'static,
    N: Network,
  {
    self.transition(
      &[LifecycleState::New, LifecycleState::Installed],
      LifecycleState::Installing,
    )?;
    info!(version = %self.generation, assets = self.manifest.len(), "Installing");

    let fetches = self.manifest.iter().map(|url| async move {
      let request = Request::new("GET", url.clone());
      let response = layer.network().fetch(&request).await?;
      if !response.is_ok() {
        return Err(eyre!("{} returned status {}", url, response.status));
      }
      Ok::<_, color_eyre::Report>((request, response))
    });

    let fetched: Result<Vec<_>> = join_all(fetches).await.into_iter().collect();
    let fetched = match fetched {
      Ok(fetched) => fetched,
      Err(e) => {
        error!("Failed to cache static assets: {}", e);
        self.set_state(LifecycleState::Installed);
        return Ok(0);
      }
    };

    let name = layer.regions().get(CacheRegion::Static).name.clone();
    if let Err(e) = layer.with_storage(move |storage| storage.open_region(&name)).await {
      warn!("Failed to open static region: {}", e);
    }
    let mut stored = 0;
    for (request, response) in &fetched {
      if layer.store(CacheRegion::Static, request, response).await {
        stored += 1;
      }
    }

    self.set_state(LifecycleState::Installed);
    info!(stored, "Static assets cached successfully");

    if self.skip_waiting {
      self.activate(layer).await?;
    }

    Ok(stored)
  }

  /// Pick up a generation installed by an earlier process.
  ///
  /// Moves straight to Running when every region of the current generation
  /// already exists in storage. Returns whether it did.
  pub async fn resume<S, N>(&self, layer: &CacheLayer<S, N>) -> Result<bool>
  where
    S: CacheStorage + ?Sized + 'static,
    N: Network,
  {
    let names = layer.with_storage(|storage| storage.region_names()).await?;
    let installed = layer
      .regions()
      .iter()
      .all(|policy| names.contains(&policy.name));
    if !installed {
      return Ok(false);
    }

    self.transition(&[LifecycleState::New], LifecycleState::Running)?;
    info!(version = %self.generation, "Resumed installed generation");
    Ok(true)
  }

  /// Drop regions of other generations, sweep, and start intercepting.
  pub async fn activate<S, N>(&self, layer: &CacheLayer<S, N>) -> Result<SweepReport>
  where
    S: CacheStorage + ?Sized + 'static,
    N: Network,
  {
    self.transition(&[LifecycleState::Installed], LifecycleState::Activating)?;
    info!(version = %self.generation, "Activating");

    let regions = layer.regions().clone();
    let migrated = layer
      .with_storage(move |storage| {
        delete_stale_regions(storage, &regions);
        for policy in regions.iter() {
          if let Err(e) = storage.open_region(&policy.name) {
            warn!(region = %policy.name, "Failed to open region: {}", e);
          }
        }
        Ok(())
      })
      .await;
    if let Err(e) = migrated {
      warn!("Region migration failed: {}", e);
    }

    let report = layer.sweep().await;

    self.set_state(LifecycleState::Running);
    info!(
      expired = report.expired_removed(),
      evicted = report.evicted(),
      "Activated"
    );
    Ok(report)
  }

  /// Handle a control message. Only `GET_VERSION` produces a reply.
  pub async fn handle_message<S, N>(
    &self,
    message: ControlMessage,
    layer: &CacheLayer<S, N>,
  ) -> Result<Option<VersionReply>>
  where
    S: CacheStorage + ?Sized + 'static,
    N: Network,
  {
    match message {
      ControlMessage::SkipWaiting => {
        match self.state() {
          LifecycleState::Installed => {
            self.activate(layer).await?;
          }
          state => info!(?state, "Nothing waiting to activate"),
        }
        Ok(None)
      }
      ControlMessage::GetVersion => Ok(Some(VersionReply {
        version: self.generation.clone(),
      })),
    }
  }
}

/// Delete every persisted region that is not part of the current generation.
fn delete_stale_regions<S: CacheStorage + ?Sized>(storage: &S, regions: &RegionSet) {
  let names = match storage.region_names() {
    Ok(names) => names,
    Err(e) => {
      error!("Failed to list cache regions: {}", e);
      return;
    }
  };

  for name in names.into_iter().filter(|n| !regions.is_current(n)) {
    let region = RegionSet::parse_region(&name);
    match storage.delete_region(&name) {
      Ok(_) => info!(name = %name, ?region, "Deleting old cache"),
      Err(e) => warn!(name = %name, "Failed to delete old cache: {}", e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheMetadata, HttpResponse, SqliteStorage};
  use crate::test_support::MockNetwork;
  use std::sync::Arc;

  const ORIGIN: &str = "https://app.example";

  fn manifest() -> Vec<Url> {
    ["/", "/index.html", "/icons/Icon-192.png"]
      .iter()
      .map(|p| Url::parse(&format!("{}{}", ORIGIN, p)).unwrap())
      .collect()
  }

  fn layer(network: Arc<MockNetwork>) -> CacheLayer<SqliteStorage, MockNetwork> {
    CacheLayer::new(
      Arc::new(SqliteStorage::in_memory().unwrap()),
      network,
      RegionSet::new("everydiary", "v2.0.0"),
    )
  }

  fn serve_manifest(network: &MockNetwork) {
    for url in manifest() {
      network.respond(url.as_str(), HttpResponse::new(200, url.path().to_string()));
    }
  }

  #[tokio::test]
  async fn test_install_populates_static_region_then_activates() {
    let network = Arc::new(MockNetwork::new());
    serve_manifest(&network);
    let layer = layer(Arc::clone(&network));
    let lifecycle = Lifecycle::new("everydiary-v2.0.0".to_string(), manifest(), true);

    let stored = lifecycle.install(&layer).await.unwrap();

    assert_eq!(stored, 3);
    assert_eq!(lifecycle.state(), LifecycleState::Running);
    let static_name = &layer.regions().get(CacheRegion::Static).name;
    assert_eq!(layer.storage().entries(static_name).unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_install_waits_without_skip_waiting() {
    let network = Arc::new(MockNetwork::new());
    serve_manifest(&network);
    let layer = layer(network);
    let lifecycle = Lifecycle::new("everydiary-v2.0.0".to_string(), manifest(), false);

    lifecycle.install(&layer).await.unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Installed);

    let reply = lifecycle
      .handle_message(ControlMessage::SkipWaiting, &layer)
      .await
      .unwrap();
    assert!(reply.is_none());
    assert_eq!(lifecycle.state(), LifecycleState::Running);
  }

  #[tokio::test]
  async fn test_failed_manifest_fetch_writes_nothing_and_waits() {
    let network = Arc::new(MockNetwork::new());
    network.respond(&format!("{}/", ORIGIN), HttpResponse::new(200, "root"));
    network.respond(&format!("{}/index.html", ORIGIN), HttpResponse::new(200, "index"));
    // icon is missing and answers 404
    let layer = layer(network);
    let lifecycle = Lifecycle::new("everydiary-v2.0.0".to_string(), manifest(), true);

    assert_eq!(lifecycle.install(&layer).await.unwrap(), 0);
    assert_eq!(lifecycle.state(), LifecycleState::Installed);
    let static_name = &layer.regions().get(CacheRegion::Static).name;
    assert!(layer.storage().entries(static_name).unwrap().is_empty());

    lifecycle.activate(&layer).await.unwrap();
    assert!(lifecycle.is_running());
  }

  #[tokio::test]
  async fn test_install_can_be_retried_after_failure() {
    let network = Arc::new(MockNetwork::offline());
    let layer = layer(Arc::clone(&network));
    let lifecycle = Lifecycle::new("everydiary-v2.0.0".to_string(), manifest(), true);

    assert_eq!(lifecycle.install(&layer).await.unwrap(), 0);

    network.set_online(true);
    serve_manifest(&network);
    assert_eq!(lifecycle.install(&layer).await.unwrap(), 3);
    assert!(lifecycle.is_running());
  }

  #[tokio::test]
  async fn test_activation_deletes_old_generations() {
    let network = Arc::new(MockNetwork::new());
    serve_manifest(&network);
    let layer = layer(network);

    let old = RegionSet::new("everydiary", "v1.0.0");
    let old_static = old.get(CacheRegion::Static);
    layer
      .storage()
      .put(
        &old_static.name,
        &Request::get("https://app.example/old.js").unwrap().identity(),
        &HttpResponse::new(200, "old"),
        &CacheMetadata::stamp(old_static, 0),
      )
      .unwrap();
    layer.storage().open_region("everydiary-v1.0.0").unwrap();

    let lifecycle = Lifecycle::new("everydiary-v2.0.0".to_string(), manifest(), true);
    lifecycle.install(&layer).await.unwrap();

    let mut names = layer.storage().region_names().unwrap();
    names.sort();
    assert_eq!(
      names,
      vec![
        "everydiary-data-v2.0.0".to_string(),
        "everydiary-dynamic-v2.0.0".to_string(),
        "everydiary-static-v2.0.0".to_string(),
      ]
    );
  }

  #[tokio::test]
  async fn test_resume_requires_installed_generation() {
    let network = Arc::new(MockNetwork::new());
    serve_manifest(&network);
    let layer = layer(network);

    let fresh = Lifecycle::new("everydiary-v2.0.0".to_string(), manifest(), true);
    assert!(!fresh.resume(&layer).await.unwrap());
    assert_eq!(fresh.state(), LifecycleState::New);

    fresh.install(&layer).await.unwrap();

    let restarted = Lifecycle::new("everydiary-v2.0.0".to_string(), manifest(), true);
    assert!(restarted.resume(&layer).await.unwrap());
    assert!(restarted.is_running());
  }

  #[tokio::test]
  async fn test_get_version_reply() {
    let layer = layer(Arc::new(MockNetwork::new()));
    let lifecycle = Lifecycle::new("everydiary-v2.0.0".to_string(), Vec::new(), true);

    let message: ControlMessage = serde_json::from_str(r#"{"type":"GET_VERSION"}"#).unwrap();
    let reply = lifecycle.handle_message(message, &layer).await.unwrap().unwrap();

    assert_eq!(
      serde_json::to_string(&reply).unwrap(),
      r#"{"version":"everydiary-v2.0.0"}"#
    );
  }

  #[test]
  fn test_control_message_parsing() {
    let skip: ControlMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(skip, ControlMessage::SkipWaiting);
    assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"RELOAD"}"#).is_err());
  }
}
