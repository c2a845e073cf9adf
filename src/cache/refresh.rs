//! Detached revalidation of cache-first hits.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::types::GenerationHandle;
use crate::net::Network;
use crate::request::{FetchRequest, ResourceKey};

/// Re-fetches a request and overwrites its cached entry on success.
///
/// The caller that triggered the refresh never observes its outcome; the only
/// visible effect is the next read of the same key.
pub struct BackgroundRefresher;

impl BackgroundRefresher {
  pub fn spawn<S: CacheStorage>(
    storage: Arc<S>,
    network: Arc<dyn Network>,
    handle: GenerationHandle,
    key: ResourceKey,
    request: FetchRequest,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      match network.fetch(&request).await {
        Ok(entry) if entry.is_cacheable() => {
          if let Err(e) = storage.put(&handle, &key, &entry) {
            warn!(url = %request.url, error = %e, "Background refresh could not store entry");
          } else {
            debug!(url = %request.url, namespace = handle.namespace(), "Background refresh stored");
          }
        }
        Ok(entry) => {
          debug!(url = %request.url, status = entry.status, "Background refresh kept cached entry");
        }
        Err(e) => {
          debug!(url = %request.url, error = %e, "Background refresh failed");
        }
      }
    })
  }
}
