//! Generation lifecycle: install a versioned asset generation, then activate
//! it and evict every namespace that no longer belongs to the deployment.

use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::types::GenerationHandle;
use crate::error::{RelayError, RelayResult};
use crate::net::Network;
use crate::request::{Destination, FetchRequest};

/// Logical cache namespaces with exactly one active generation each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
  Assets,
  Api,
}

impl Slot {
  pub fn as_str(&self) -> &'static str {
    match self {
      Slot::Assets => "assets",
      Slot::Api => "api",
    }
  }
}

/// A generation whose critical assets are all stored. Only obtainable from a
/// successful install or from storage that recorded one.
#[derive(Debug, Clone)]
pub struct InstalledGeneration {
  handle: GenerationHandle,
}

impl InstalledGeneration {
  pub fn namespace(&self) -> &str {
    self.handle.namespace()
  }
}

/// Outcome of an activation.
#[derive(Debug, Default)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  pub failed: Vec<(String, String)>,
}

#[derive(Debug, Default, Clone)]
struct ActiveSet {
  assets: Option<GenerationHandle>,
  api: Option<GenerationHandle>,
}

/// Tracks the active generation per slot.
///
/// Readers take a snapshot handle; activation persists both pointers in one
/// transaction, then swaps them under one write lock.
pub struct Generations<S: CacheStorage> {
  storage: Arc<S>,
  active: RwLock<ActiveSet>,
}

impl<S: CacheStorage> Generations<S> {
  /// Load the persisted active pointers.
  pub fn load(storage: Arc<S>) -> RelayResult<Self> {
    let active = ActiveSet {
      assets: storage.active(Slot::Assets)?.map(GenerationHandle::new),
      api: storage.active(Slot::Api)?.map(GenerationHandle::new),
    };

    Ok(Self {
      storage,
      active: RwLock::new(active),
    })
  }

  /// Snapshot of the active generation for a slot.
  pub fn active(&self, slot: Slot) -> Option<GenerationHandle> {
    let active = match self.active.read() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    match slot {
      Slot::Assets => active.assets.clone(),
      Slot::Api => active.api.clone(),
    }
  }

  /// Fetch every critical asset and store them as `namespace`.
  ///
  /// Assets are fetched concurrently and all complete before anything is
  /// written; the write is a single transaction. Any failed or unsuccessful
  /// fetch aborts the install and leaves storage untouched.
  pub async fn install(
    &self,
    network: &dyn Network,
    origin: &Url,
    namespace: &str,
    critical_assets: &[String],
  ) -> RelayResult<InstalledGeneration> {
    info!(namespace, count = critical_assets.len(), "Installing generation");

    let requests = critical_assets
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map(|url| (path.as_str(), FetchRequest::get(url).with_destination(Destination::Empty)))
          .map_err(|e| RelayError::Config(format!("Invalid critical asset path {}: {}", path, e)))
      })
      .collect::<RelayResult<Vec<_>>>()?;

    let entries = try_join_all(requests.iter().map(|(path, request)| async move {
      let entry = network
        .fetch(request)
        .await
        .map_err(|e| install_failed(path, e))?;
      if !entry.is_cacheable() {
        return Err(install_failed(
          path,
          RelayError::ServerError {
            status: entry.status,
            body: String::from_utf8_lossy(&entry.body).into_owned(),
          },
        ));
      }
      Ok::<_, RelayError>((request.resource_key(), entry))
    }))
    .await?;

    let handle = self.storage.seed(namespace, &entries)?;
    info!(namespace, "Generation installed");
    Ok(InstalledGeneration { handle })
  }

  /// Look up a previously installed generation.
  pub fn installed(&self, namespace: &str) -> RelayResult<Option<InstalledGeneration>> {
    if self.storage.is_complete(namespace)? {
      Ok(Some(InstalledGeneration {
        handle: GenerationHandle::new(namespace),
      }))
    } else {
      Ok(None)
    }
  }

  /// Make `namespace` the API generation if no API generation is active yet.
  ///
  /// API responses are cached from the first request onwards, before any
  /// asset generation has been deployed.
  pub fn ensure_api(&self, namespace: &str) -> RelayResult<GenerationHandle> {
    if let Some(current) = self.active(Slot::Api) {
      return Ok(current);
    }

    let api = self.storage.open_or_create(namespace)?;
    self.storage.set_active(&[(Slot::Api, api.namespace())])?;
    self.write_active().api = Some(api.clone());
    info!(api = api.namespace(), "API generation opened");
    Ok(api)
  }

  /// Promote `installed` as the asset generation and `api_namespace` as the
  /// API generation, then delete every other namespace.
  ///
  /// Deletions are attempted independently; a failed deletion is reported
  /// but does not undo the activation.
  pub fn activate(
    &self,
    installed: &InstalledGeneration,
    api_namespace: &str,
  ) -> RelayResult<ActivationReport> {
    let api = self.storage.open_or_create(api_namespace)?;
    self.storage.set_active(&[
      (Slot::Assets, installed.namespace()),
      (Slot::Api, api.namespace()),
    ])?;

    *self.write_active() = ActiveSet {
      assets: Some(installed.handle.clone()),
      api: Some(api.clone()),
    };
    info!(
      assets = installed.namespace(),
      api = api.namespace(),
      "Generation activated"
    );

    let keep: BTreeSet<&str> = [installed.namespace(), api.namespace()].into();
    let mut report = ActivationReport::default();

    let namespaces = match self.storage.list_namespaces() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "Could not enumerate namespaces for eviction");
        return Ok(report);
      }
    };

    for name in namespaces.into_iter().filter(|n| !keep.contains(n.as_str())) {
      match self.storage.delete_namespace(&name) {
        Ok(()) => {
          info!(namespace = %name, "Deleted stale namespace");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(namespace = %name, error = %e, "Failed to delete stale namespace");
          report.failed.push((name, e.to_string()));
        }
      }
    }

    Ok(report)
  }

  fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, ActiveSet> {
    match self.active.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

fn install_failed(path: &str, source: RelayError) -> RelayError {
  RelayError::InstallFailed {
    path: path.to_string(),
    source: Box::new(source),
  }
}
