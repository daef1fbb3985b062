//! The cache system: one object owning the regions, strategies, write queue
//! and lifecycle, constructed once and shared by every request task.

use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CacheLayer, CacheResult, CacheStorage, HttpResponse, NoopStorage, Request, SqliteStorage,
  SweepReport,
};
use crate::config::Config;
use crate::lifecycle::{ControlMessage, Lifecycle, LifecycleState, VersionReply};
use crate::net::{HttpNetwork, HttpRemoteApi, Network, RemoteApi};
use crate::queue::{DrainReport, QueueItemType, SqliteQueue, WriteQueue};
use crate::router::{Router, Strategy};

/// Sync event tag that replays the write queue
pub const SYNC_TAG: &str = "background-sync";

/// Cache system wired to SQLite, reqwest and the HTTP backend.
pub type HttpCacheSystem = CacheSystem<dyn CacheStorage, HttpNetwork, HttpRemoteApi>;

pub struct CacheSystem<S: CacheStorage + ?Sized, N: Network, R: RemoteApi> {
  layer: CacheLayer<S, N>,
  router: Router,
  lifecycle: Lifecycle,
  queue: WriteQueue,
  remote: R,
  origin: Url,
}

impl HttpCacheSystem {
  pub fn from_config(config: &Config) -> Result<Self> {
    let storage: Arc<dyn CacheStorage> = match (config.cache.enabled, &config.cache.database) {
      (false, _) => Arc::new(NoopStorage),
      (true, Some(path)) => Arc::new(SqliteStorage::open(path)?),
      (true, None) => Arc::new(SqliteStorage::open_default()?),
    };

    let queue = match &config.queue.database {
      Some(path) => SqliteQueue::open(path)?,
      None => SqliteQueue::open_default()?,
    };

    let network = HttpNetwork::new(config.network_timeout())?;
    let remote = HttpRemoteApi::new(
      config.backend_url()?,
      Config::get_api_token(),
      config.network_timeout(),
    )?;

    let regions = config.region_set();
    let lifecycle = Lifecycle::new(
      regions.generation(),
      config.manifest_urls()?,
      config.skip_waiting,
    );

    Ok(Self::new(
      CacheLayer::new(storage, Arc::new(network), regions),
      Router::from_config(config),
      lifecycle,
      WriteQueue::new(queue),
      remote,
      config.origin_url()?,
    ))
  }
}

impl<S, N, R> CacheSystem<S, N, R>
where
  S: CacheStorage + ?Sized + 'static,
  N: Network,
  R: RemoteApi,
{
  pub fn new(
    layer: CacheLayer<S, N>,
    router: Router,
    lifecycle: Lifecycle,
    queue: WriteQueue,
    remote: R,
    origin: Url,
  ) -> Self {
    Self {
      layer,
      router,
      lifecycle,
      queue,
      remote,
      origin,
    }
  }

  pub fn layer(&self) -> &CacheLayer<S, N> {
    &self.layer
  }

  pub fn router(&self) -> &Router {
    &self.router
  }

  pub fn lifecycle(&self) -> &Lifecycle {
    &self.lifecycle
  }

  pub fn queue(&self) -> &WriteQueue {
    &self.queue
  }

  /// Build a request, resolving relative URLs against the origin.
  pub fn request(&self, method: &str, url: &str) -> Result<Request> {
    Request::resolve(method, &self.origin, url)
  }

  /// Answer an intercepted request.
  ///
  /// Returns `None` when the request is not intercepted: the layer is not
  /// running yet, or the method is not GET. The host then talks to the
  /// network itself.
  pub async fn handle(&self, request: &Request) -> Option<CacheResult<HttpResponse>> {
    if !self.lifecycle.is_running() {
      debug!(url = %request.url, state = ?self.lifecycle.state(), "Not active, passing through");
      return None;
    }

    let route = self.router.route(request)?;
    debug!(url = %request.url, ?route, "Routing request");

    let result = match route.strategy {
      Strategy::CacheFirst => self.layer.cache_first(request, route.region).await,
      Strategy::NetworkFirst => self.layer.network_first(request, route.region).await,
      Strategy::StaleWhileRevalidate => {
        self
          .layer
          .stale_while_revalidate(request, route.region)
          .await
      }
    };

    Some(result)
  }

  pub async fn install(&self) -> Result<usize> {
    self.lifecycle.install(&self.layer).await
  }

  /// Bring the system up: resume an installed generation, or install one
  /// and activate it.
  ///
  /// Never fails. A failed install leaves an empty static region and the
  /// system still starts intercepting, answering from the network or with
  /// the offline response.
  pub async fn start(&self) {
    match self.lifecycle.resume(&self.layer).await {
      Ok(true) => return,
      Ok(false) => {}
      Err(e) => warn!("Failed to resume installed generation: {}", e),
    }

    if let Err(e) = self.install().await {
      warn!("Install failed: {}", e);
    }
    if self.lifecycle.state() == LifecycleState::Installed {
      if let Err(e) = self.activate().await {
        warn!("Activation failed: {}", e);
      }
    }
  }

  pub async fn activate(&self) -> Result<SweepReport> {
    self.lifecycle.activate(&self.layer).await
  }

  pub async fn handle_message(&self, message: ControlMessage) -> Result<Option<VersionReply>> {
    self.lifecycle.handle_message(message, &self.layer).await
  }

  pub fn version(&self) -> &str {
    self.lifecycle.version()
  }

  /// On-demand eviction sweep.
  pub async fn sweep(&self) -> SweepReport {
    self.layer.sweep().await
  }

  /// Defer a write the host could not complete against the backend.
  pub async fn enqueue(&self, kind: QueueItemType, data: Value) -> Result<i64> {
    self.queue.enqueue(kind, data).await
  }

  pub async fn drain(&self) -> DrainReport {
    self.queue.drain(&self.remote).await
  }

  /// Sync event from the host; only [`SYNC_TAG`] drains the queue.
  pub async fn on_sync(&self, tag: &str) -> Option<DrainReport> {
    if tag != SYNC_TAG {
      info!(tag, "Ignoring sync event");
      return None;
    }
    Some(self.drain().await)
  }

  pub async fn on_connectivity_restored(&self) -> DrainReport {
    info!("Connectivity restored");
    self.drain().await
  }
}
