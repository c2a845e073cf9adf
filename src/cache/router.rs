//! Routes classified requests to a caching strategy.

use std::sync::Arc;
use tracing::{debug, warn};

use super::generation::{Generations, Slot};
use super::refresh::BackgroundRefresher;
use super::storage::CacheStorage;
use super::types::{CacheResult, GenerationHandle, ResourceEntry};
use crate::classify::{RequestClass, RequestClassifier};
use crate::error::RelayResult;
use crate::net::Network;
use crate::request::{FetchRequest, ResourceKey};

/// Sits between the application and the network, providing per-class
/// caching with offline fallback.
pub struct CacheRouter<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  generations: Arc<Generations<S>>,
  classifier: RequestClassifier,
}

impl<S: CacheStorage> CacheRouter<S> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<dyn Network>,
    generations: Arc<Generations<S>>,
    classifier: RequestClassifier,
  ) -> Self {
    Self {
      storage,
      network,
      generations,
      classifier,
    }
  }

  /// Classify `request` and serve it with the matching strategy.
  pub async fn handle(&self, request: FetchRequest) -> RelayResult<CacheResult> {
    let class = self.classifier.classify(&request);
    debug!(method = %request.method, url = %request.url, %class, "Routing request");

    match class {
      RequestClass::CriticalAsset | RequestClass::StaticAsset => {
        self.cache_first(request, class).await
      }
      RequestClass::ApiEndpoint => self.network_first(request, class, Some(Slot::Api)).await,
      RequestClass::Other => self.network_first(request, class, None).await,
    }
  }

  /// Serve from the active asset generation; on a hit, revalidate in the
  /// background without waiting.
  ///
  /// 1. Hit: return the cached entry and spawn a refresh
  /// 2. Miss: fetch, store a copy if successful, return
  /// 3. Miss and network failure: propagate (nothing to fall back to)
  async fn cache_first(&self, request: FetchRequest, class: RequestClass) -> RelayResult<CacheResult> {
    let handle = self
      .generations
      .active(Slot::Assets)
      .filter(|_| request.is_cacheable_method());
    let key = request.resource_key();

    if let Some(handle) = &handle {
      if let Some(entry) = self.lookup(handle, &key) {
        debug!(url = %request.url, namespace = handle.namespace(), "Cache hit");
        BackgroundRefresher::spawn(
          Arc::clone(&self.storage),
          Arc::clone(&self.network),
          handle.clone(),
          key,
          request,
        );
        return Ok(CacheResult::from_cache(entry, class));
      }
      debug!(url = %request.url, namespace = handle.namespace(), "Cache miss");
    }

    let entry = self.network.fetch(&request).await?;
    if let Some(handle) = &handle {
      self.store(handle, &key, &entry);
    }
    Ok(CacheResult::from_network(entry, class))
  }

  /// Prefer the network. Only a network failure (no response at all) falls
  /// back to a stored copy; any response from the server is returned as-is.
  ///
  /// With `store_slot` set, successful responses are written to that slot's
  /// active generation; otherwise the store is only read.
  async fn network_first(
    &self,
    request: FetchRequest,
    class: RequestClass,
    store_slot: Option<Slot>,
  ) -> RelayResult<CacheResult> {
    let key = request.resource_key();

    match self.network.fetch(&request).await {
      Ok(entry) => {
        if request.is_cacheable_method() {
          if let Some(handle) = store_slot.and_then(|slot| self.generations.active(slot)) {
            self.store(&handle, &key, &entry);
          }
        }
        Ok(CacheResult::from_network(entry, class))
      }
      Err(e) if e.is_network_failure() => {
        let fallback_slots: &[Slot] = match store_slot {
          Some(Slot::Api) => &[Slot::Api],
          Some(Slot::Assets) => &[Slot::Assets],
          None => &[Slot::Assets, Slot::Api],
        };

        for slot in fallback_slots {
          if let Some(handle) = self.generations.active(*slot) {
            if let Some(entry) = self.lookup(&handle, &key) {
              debug!(url = %request.url, namespace = handle.namespace(), "Serving offline fallback");
              return Ok(CacheResult::offline(entry, class));
            }
          }
        }

        debug!(url = %request.url, error = %e, "Network failed with no cached fallback");
        Err(e)
      }
      Err(e) => Err(e),
    }
  }

  /// Storage errors on read degrade to a miss.
  fn lookup(&self, handle: &GenerationHandle, key: &ResourceKey) -> Option<ResourceEntry> {
    match self.storage.get(handle, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(namespace = handle.namespace(), error = %e, "Cache lookup failed, treating as miss");
        None
      }
    }
  }

  /// Storage errors on write are logged and swallowed; serving the response
  /// takes priority.
  fn store(&self, handle: &GenerationHandle, key: &ResourceKey, entry: &ResourceEntry) {
    if !entry.is_cacheable() {
      return;
    }
    if let Err(e) = self.storage.put(handle, key, entry) {
      warn!(namespace = handle.namespace(), error = %e, "Failed to cache response");
    }
  }
}
