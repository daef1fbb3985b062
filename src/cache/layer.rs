//! Cache layer that reconciles cache lookups with network fetches.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use super::eviction::{self, SweepReport};
use super::metadata::{is_expired, now_ms, CacheMetadata};
use super::storage::{CacheStorage, CachedResponse};
use super::traits::{
  CacheRegion, CacheResult, HttpResponse, RegionPolicy, RegionSet, Request, RequestIdentity,
};
use crate::net::Network;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the network, providing the
/// fetch strategies with offline support. Network failures never escape it:
/// every strategy resolves to a response, falling back to the cache or to
/// the synthetic 503. Storage calls run on the blocking pool.
pub struct CacheLayer<S: CacheStorage + ?Sized, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  regions: Arc<RegionSet>,
}

impl<S: CacheStorage + ?Sized + 'static, N: Network> CacheLayer<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, regions: RegionSet) -> Self {
    Self {
      storage,
      network,
      regions: Arc::new(regions),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  pub fn regions(&self) -> &RegionSet {
    &self.regions
  }

  /// Run `op` against the storage on the blocking pool.
  pub async fn with_storage<T, F>(&self, op: F) -> Result<T>
  where
    F: FnOnce(&S) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    blocking(Arc::clone(&self.storage), op).await
  }

  /// Serve from cache when fresh; fetch on miss or expiry.
  pub async fn cache_first(&self, request: &Request, region: CacheRegion) -> CacheResult<HttpResponse> {
    let policy = self.regions.get(region);
    let identity = request.identity();

    if let Some(cached) = self.lookup(policy, &identity).await {
      if !is_expired(cached.metadata.as_ref(), policy.expiry, now_ms()) {
        debug!(url = %request.url, region = %policy.name, "Serving from cache");
        let cached_at = written_at(&cached);
        return CacheResult::from_cache(cached.response, cached_at, false);
      }
      self.remove(policy, &identity).await;
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        store_on_success(Arc::clone(&self.storage), policy, &identity, &response).await;
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, "Cache-first fetch failed: {}", e);
        CacheResult::unavailable()
      }
    }
  }

  /// Always try the network; fall back to a fresh cache entry only when it fails.
  pub async fn network_first(&self, request: &Request, region: CacheRegion) -> CacheResult<HttpResponse> {
    let policy = self.regions.get(region);
    let identity = request.identity();

    let error = match self.network.fetch(request).await {
      Ok(response) => {
        store_on_success(Arc::clone(&self.storage), policy, &identity, &response).await;
        return CacheResult::from_network(response);
      }
      Err(e) => e,
    };

    debug!(url = %request.url, "Network failed, trying cache: {}", error);

    if let Some(cached) = self.lookup(policy, &identity).await {
      if !is_expired(cached.metadata.as_ref(), policy.expiry, now_ms()) {
        let cached_at = written_at(&cached);
        return CacheResult::offline(cached.response, cached_at);
      }
      self.remove(policy, &identity).await;
    }

    CacheResult::unavailable()
  }

  /// Serve whatever is cached right away and refresh it in the background.
  ///
  /// With nothing cached, waits for the network. The background refresh is
  /// never awaited when a cached value exists; its failures are only logged.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    region: CacheRegion,
  ) -> CacheResult<HttpResponse> {
    let policy = self.regions.get(region);
    let identity = request.identity();
    let cached = self.lookup(policy, &identity).await;

    let revalidate = {
      let storage = Arc::clone(&self.storage);
      let network = Arc::clone(&self.network);
      let regions = Arc::clone(&self.regions);
      let request = request.clone();
      let identity = identity.clone();

      tokio::spawn(async move {
        match network.fetch(&request).await {
          Ok(response) => {
            store_on_success(storage, regions.get(region), &identity, &response).await;
            Some(response)
          }
          Err(e) => {
            debug!(url = %request.url, "Background revalidation failed: {}", e);
            None
          }
        }
      })
    };

    if let Some(cached) = cached {
      let stale = is_expired(cached.metadata.as_ref(), policy.expiry, now_ms());
      debug!(url = %request.url, stale, "Serving from cache, revalidating");
      let cached_at = written_at(&cached);
      return CacheResult::from_cache(cached.response, cached_at, stale);
    }

    match revalidate.await {
      Ok(Some(response)) => CacheResult::from_network(response),
      Ok(None) => CacheResult::unavailable(),
      Err(e) => {
        warn!(url = %request.url, "Revalidation task failed: {}", e);
        CacheResult::unavailable()
      }
    }
  }

  /// Cache-first against the `data` region.
  pub async fn data(&self, request: &Request) -> CacheResult<HttpResponse> {
    self.cache_first(request, CacheRegion::Data).await
  }

  /// Store a successful response into `region`. Returns whether it was written.
  pub async fn store(&self, region: CacheRegion, request: &Request, response: &HttpResponse) -> bool {
    store_on_success(
      Arc::clone(&self.storage),
      self.regions.get(region),
      &request.identity(),
      response,
    )
    .await
  }

  /// Run one eviction sweep over all current regions.
  pub async fn sweep(&self) -> SweepReport {
    let regions = Arc::clone(&self.regions);
    let swept = self
      .with_storage(move |storage| Ok(eviction::sweep(storage, &regions, now_ms())))
      .await;

    swept.unwrap_or_else(|e| {
      warn!("Sweep failed: {}", e);
      SweepReport::default()
    })
  }

  /// Cache read that degrades to a miss on storage errors.
  async fn lookup(&self, policy: &RegionPolicy, identity: &RequestIdentity) -> Option<CachedResponse> {
    let region = policy.name.clone();
    let key = identity.key.clone();
    match self.with_storage(move |storage| storage.get(&region, &key)).await {
      Ok(cached) => cached,
      Err(e) => {
        warn!(
          region = %policy.name,
          request = %identity.description,
          "Cache lookup failed, treating as miss: {}",
          e
        );
        None
      }
    }
  }

  async fn remove(&self, policy: &RegionPolicy, identity: &RequestIdentity) {
    let region = policy.name.clone();
    let key = identity.key.clone();
    match self.with_storage(move |storage| storage.delete(&region, &key)).await {
      Ok(_) => debug!(request = %identity.description, "Expired cache deleted"),
      Err(e) => warn!(
        region = %policy.name,
        request = %identity.description,
        "Failed to delete expired entry: {}",
        e
      ),
    }
  }
}

impl<S: CacheStorage + ?Sized, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      regions: Arc::clone(&self.regions),
    }
  }
}

async fn blocking<S, T, F>(storage: Arc<S>, op: F) -> Result<T>
where
  S: CacheStorage + ?Sized + 'static,
  F: FnOnce(&S) -> Result<T> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(move || op(storage.as_ref()))
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
}

/// Write an ok response with fresh metadata. Storage errors are logged and swallowed.
async fn store_on_success<S: CacheStorage + ?Sized + 'static>(
  storage: Arc<S>,
  policy: &RegionPolicy,
  identity: &RequestIdentity,
  response: &HttpResponse,
) -> bool {
  if !response.is_ok() {
    return false;
  }

  let metadata = CacheMetadata::stamp(policy, now_ms());
  let region = policy.name.clone();
  let owned_identity = identity.clone();
  let owned_response = response.clone();
  let stored = blocking(storage, move |storage| {
    storage.put(&region, &owned_identity, &owned_response, &metadata)
  })
  .await;

  match stored {
    Ok(()) => true,
    Err(e) => {
      warn!(
        region = %policy.name,
        request = %identity.description,
        "Failed to store response: {}",
        e
      );
      false
    }
  }
}

fn written_at(cached: &CachedResponse) -> Option<chrono::DateTime<chrono::Utc>> {
  cached.metadata.as_ref().and_then(CacheMetadata::written_at)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{EntrySummary, SqliteStorage};
  use crate::cache::traits::CacheSource;
  use crate::test_support::MockNetwork;
  use chrono::Duration;
  use color_eyre::{eyre::eyre, Result};
  use std::time::Duration as StdDuration;

  const ORIGIN: &str = "https://app.example";

  fn setup(network: MockNetwork) -> (CacheLayer<SqliteStorage, MockNetwork>, Arc<SqliteStorage>, Arc<MockNetwork>) {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let network = Arc::new(network);
    let layer = CacheLayer::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      RegionSet::new("everydiary", "v2.0.0"),
    );
    (layer, storage, network)
  }

  fn request(path: &str) -> Request {
    Request::get(&format!("{}{}", ORIGIN, path)).unwrap()
  }

  /// Seed an entry written `age` ago.
  fn seed(layer: &CacheLayer<SqliteStorage, MockNetwork>, region: CacheRegion, path: &str, body: &str, age: Duration) {
    let policy = layer.regions().get(region);
    let metadata = CacheMetadata::stamp(policy, now_ms() - age.num_milliseconds());
    layer
      .storage()
      .put(&policy.name, &request(path).identity(), &HttpResponse::new(200, body), &metadata)
      .unwrap();
  }

  fn cached_body(layer: &CacheLayer<SqliteStorage, MockNetwork>, region: CacheRegion, path: &str) -> Option<Vec<u8>> {
    let policy = layer.regions().get(region);
    layer
      .storage()
      .get(&policy.name, &request(path).identity().key)
      .unwrap()
      .map(|c| c.response.body)
  }

  #[tokio::test]
  async fn test_cache_first_fresh_entry_skips_network() {
    let (layer, _, network) = setup(MockNetwork::new());
    seed(&layer, CacheRegion::Static, "/icons/Icon-192.png", "png", Duration::hours(1));

    let result = layer
      .cache_first(&request("/icons/Icon-192.png"), CacheRegion::Static)
      .await;

    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(result.data.body, b"png");
    assert!(result.cached_at.is_some());
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let (layer, _, network) = setup(MockNetwork::new());
    network.respond(&format!("{}/index.html", ORIGIN), HttpResponse::new(200, "<html>"));

    let first = layer.cache_first(&request("/index.html"), CacheRegion::Static).await;
    let second = layer.cache_first(&request("/index.html"), CacheRegion::Static).await;

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data.body, b"<html>");
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_expired_entry_refetches_once() {
    let (layer, _, network) = setup(MockNetwork::new());
    seed(&layer, CacheRegion::Static, "/flutter.js", "old", Duration::days(8));
    network.respond(&format!("{}/flutter.js", ORIGIN), HttpResponse::new(200, "new"));

    let result = layer.cache_first(&request("/flutter.js"), CacheRegion::Static).await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"new");
    assert_eq!(network.calls(), 1);
    assert_eq!(cached_body(&layer, CacheRegion::Static, "/flutter.js"), Some(b"new".to_vec()));
  }

  #[tokio::test]
  async fn test_cache_first_expired_entry_offline_is_deleted() {
    let (layer, _, network) = setup(MockNetwork::offline());
    seed(&layer, CacheRegion::Static, "/flutter.js", "old", Duration::days(8));

    let result = layer.cache_first(&request("/flutter.js"), CacheRegion::Static).await;

    assert_eq!(result.source, CacheSource::Unavailable);
    assert_eq!(result.data, HttpResponse::offline());
    assert_eq!(network.calls(), 1);
    assert_eq!(cached_body(&layer, CacheRegion::Static, "/flutter.js"), None);
  }

  #[tokio::test]
  async fn test_cache_first_entry_without_metadata_is_refetched() {
    let (layer, storage, network) = setup(MockNetwork::new());
    seed(&layer, CacheRegion::Static, "/manifest.json", "old", Duration::zero());
    let policy = layer.regions().get(CacheRegion::Static);
    storage
      .strip_metadata(&policy.name, &request("/manifest.json").identity().key)
      .unwrap();
    network.respond(&format!("{}/manifest.json", ORIGIN), HttpResponse::new(200, "{}"));

    let result = layer.cache_first(&request("/manifest.json"), CacheRegion::Static).await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_error_responses_are_returned_but_not_cached() {
    let (layer, _, network) = setup(MockNetwork::new());

    let result = layer.cache_first(&request("/missing.css"), CacheRegion::Static).await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 404);
    assert_eq!(cached_body(&layer, CacheRegion::Static, "/missing.css"), None);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_network_first_prefers_network_over_fresh_cache() {
    let (layer, _, network) = setup(MockNetwork::new());
    seed(&layer, CacheRegion::Dynamic, "/api/diary", "cached", Duration::minutes(1));
    network.respond(&format!("{}/api/diary", ORIGIN), HttpResponse::new(200, "live"));

    let result = layer.network_first(&request("/api/diary"), CacheRegion::Dynamic).await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"live");
    assert_eq!(network.calls(), 1);
    assert_eq!(cached_body(&layer, CacheRegion::Dynamic, "/api/diary"), Some(b"live".to_vec()));
  }

  #[tokio::test]
  async fn test_network_first_offline_serves_fresh_cache() {
    let (layer, _, _) = setup(MockNetwork::offline());
    seed(&layer, CacheRegion::Dynamic, "/api/diary", "cached", Duration::minutes(1));

    let result = layer.network_first(&request("/api/diary"), CacheRegion::Dynamic).await;

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"cached");
  }

  #[tokio::test]
  async fn test_network_first_offline_expired_cache_is_deleted() {
    let (layer, _, _) = setup(MockNetwork::offline());
    seed(&layer, CacheRegion::Dynamic, "/api/diary", "cached", Duration::days(2));

    let result = layer.network_first(&request("/api/diary"), CacheRegion::Dynamic).await;

    assert_eq!(result.source, CacheSource::Unavailable);
    assert_eq!(result.data.status, 503);
    assert_eq!(cached_body(&layer, CacheRegion::Dynamic, "/api/diary"), None);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_cache_then_updates() {
    let (layer, _, network) = setup(MockNetwork::new());
    seed(&layer, CacheRegion::Dynamic, "/photos/cat.jpg", "v1", Duration::minutes(5));
    network.respond(&format!("{}/photos/cat.jpg", ORIGIN), HttpResponse::new(200, "v2"));

    let first = layer
      .stale_while_revalidate(&request("/photos/cat.jpg"), CacheRegion::Dynamic)
      .await;
    assert_eq!(first.data.body, b"v1");
    assert_eq!(first.source, CacheSource::CacheFresh);

    let mut refreshed = false;
    for _ in 0..100 {
      if cached_body(&layer, CacheRegion::Dynamic, "/photos/cat.jpg") == Some(b"v2".to_vec()) {
        refreshed = true;
        break;
      }
      tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(refreshed, "background revalidation never stored the new value");

    let second = layer
      .stale_while_revalidate(&request("/photos/cat.jpg"), CacheRegion::Dynamic)
      .await;
    assert_eq!(second.data.body, b"v2");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_expired_entry() {
    let (layer, _, _) = setup(MockNetwork::offline());
    seed(&layer, CacheRegion::Dynamic, "/photos/old.png", "old", Duration::days(3));

    let result = layer
      .stale_while_revalidate(&request("/photos/old.png"), CacheRegion::Dynamic)
      .await;

    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.body, b"old");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_waits_for_network() {
    let (layer, _, network) = setup(MockNetwork::new());
    network.respond(&format!("{}/photos/dog.webp", ORIGIN), HttpResponse::new(200, "dog"));

    let result = layer
      .stale_while_revalidate(&request("/photos/dog.webp"), CacheRegion::Dynamic)
      .await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"dog");
    assert_eq!(cached_body(&layer, CacheRegion::Dynamic, "/photos/dog.webp"), Some(b"dog".to_vec()));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_offline_is_unavailable() {
    let (layer, _, _) = setup(MockNetwork::offline());

    let result = layer
      .stale_while_revalidate(&request("/photos/dog.webp"), CacheRegion::Dynamic)
      .await;

    assert_eq!(result.source, CacheSource::Unavailable);
    assert_eq!(result.data, HttpResponse::offline());
  }

  #[tokio::test]
  async fn test_data_strategy_uses_data_region_expiry() {
    let (layer, _, network) = setup(MockNetwork::new());
    seed(&layer, CacheRegion::Data, "/user/profile", "fresh", Duration::minutes(30));
    seed(&layer, CacheRegion::Data, "/user/settings", "stale", Duration::hours(2));
    network.respond(&format!("{}/user/settings", ORIGIN), HttpResponse::new(200, "new"));

    let fresh = layer.data(&request("/user/profile")).await;
    let stale = layer.data(&request("/user/settings")).await;

    assert_eq!(fresh.source, CacheSource::CacheFresh);
    assert_eq!(stale.source, CacheSource::Network);
    assert_eq!(stale.data.body, b"new");
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_stores_to_same_identity_leave_one_entry() {
    let (layer, storage, network) = setup(MockNetwork::new());
    network.respond(&format!("{}/api/feed", ORIGIN), HttpResponse::new(200, "feed"));

    let tasks: Vec<_> = (0..8)
      .map(|_| {
        let layer = layer.clone();
        tokio::spawn(async move { layer.network_first(&request("/api/feed"), CacheRegion::Dynamic).await })
      })
      .collect();
    for task in tasks {
      assert_eq!(task.await.unwrap().data.body, b"feed");
    }

    let policy = layer.regions().get(CacheRegion::Dynamic);
    assert_eq!(storage.entries(&policy.name).unwrap().len(), 1);
  }

  /// Storage whose every operation fails.
  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn open_region(&self, _: &str) -> Result<()> {
      Err(eyre!("disk full"))
    }
    fn region_names(&self) -> Result<Vec<String>> {
      Err(eyre!("disk full"))
    }
    fn delete_region(&self, _: &str) -> Result<bool> {
      Err(eyre!("disk full"))
    }
    fn get(&self, _: &str, _: &str) -> Result<Option<CachedResponse>> {
      Err(eyre!("disk full"))
    }
    fn put(&self, _: &str, _: &RequestIdentity, _: &HttpResponse, _: &CacheMetadata) -> Result<()> {
      Err(eyre!("disk full"))
    }
    fn delete(&self, _: &str, _: &str) -> Result<bool> {
      Err(eyre!("disk full"))
    }
    fn delete_if_written_at(&self, _: &str, _: &str, _: Option<i64>) -> Result<bool> {
      Err(eyre!("disk full"))
    }
    fn entries(&self, _: &str) -> Result<Vec<EntrySummary>> {
      Err(eyre!("disk full"))
    }
    fn region_size(&self, _: &str) -> Result<u64> {
      Err(eyre!("disk full"))
    }
  }

  /// Storage whose reads take a while.
  struct SlowStorage(SqliteStorage);

  impl CacheStorage for SlowStorage {
    fn open_region(&self, name: &str) -> Result<()> {
      self.0.open_region(name)
    }
    fn region_names(&self) -> Result<Vec<String>> {
      self.0.region_names()
    }
    fn delete_region(&self, name: &str) -> Result<bool> {
      self.0.delete_region(name)
    }
    fn get(&self, region: &str, key: &str) -> Result<Option<CachedResponse>> {
      std::thread::sleep(StdDuration::from_millis(300));
      self.0.get(region, key)
    }
    fn put(&self, region: &str, identity: &RequestIdentity, response: &HttpResponse, metadata: &CacheMetadata) -> Result<()> {
      self.0.put(region, identity, response, metadata)
    }
    fn delete(&self, region: &str, key: &str) -> Result<bool> {
      self.0.delete(region, key)
    }
    fn delete_if_written_at(&self, region: &str, key: &str, written_at_ms: Option<i64>) -> Result<bool> {
      self.0.delete_if_written_at(region, key, written_at_ms)
    }
    fn entries(&self, region: &str) -> Result<Vec<EntrySummary>> {
      self.0.entries(region)
    }
    fn region_size(&self, region: &str) -> Result<u64> {
      self.0.region_size(region)
    }
  }

  #[tokio::test]
  async fn test_slow_storage_does_not_stall_the_runtime() {
    let network = Arc::new(MockNetwork::new());
    network.respond(&format!("{}/index.html", ORIGIN), HttpResponse::new(200, "<html>"));
    let layer = CacheLayer::new(
      Arc::new(SlowStorage(SqliteStorage::in_memory().unwrap())),
      network,
      RegionSet::new("everydiary", "v2.0.0"),
    );

    let req = request("/index.html");
    let lookup = layer.cache_first(&req, CacheRegion::Static);
    tokio::pin!(lookup);

    let timer_first = tokio::select! {
      biased;
      _ = &mut lookup => false,
      _ = tokio::time::sleep(StdDuration::from_millis(50)) => true,
    };
    assert!(timer_first, "storage read blocked the runtime thread");

    let result = lookup.await;
    assert_eq!(result.data.body, b"<html>");
  }

  #[tokio::test]
  async fn test_storage_failures_fail_open_to_network() {
    let network = Arc::new(MockNetwork::new());
    network.respond(&format!("{}/index.html", ORIGIN), HttpResponse::new(200, "<html>"));
    let layer = CacheLayer::new(
      Arc::new(BrokenStorage),
      Arc::clone(&network),
      RegionSet::new("everydiary", "v2.0.0"),
    );

    let result = layer.cache_first(&request("/index.html"), CacheRegion::Static).await;
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"<html>");

    network.set_online(false);
    let result = layer.network_first(&request("/index.html"), CacheRegion::Dynamic).await;
    assert_eq!(result.source, CacheSource::Unavailable);

    assert!(layer.sweep().await.regions.is_empty());
  }
}
