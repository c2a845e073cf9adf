//! The intermediary as a whole: request interception, generation lifecycle,
//! and offline capture of mutating submissions.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{
  ActivationReport, CacheResult, CacheRouter, CacheStorage, Generations, InstalledGeneration,
  Slot, SqliteStorage,
};
use crate::classify::RequestClassifier;
use crate::config::Config;
use crate::error::{RelayError, RelayResult};
use crate::net::{HttpNetwork, HttpSubmitter, Network};
use crate::queue::{PendingOperation, RetryQueue, Submitter};
use crate::request::FetchRequest;
use crate::sync::SyncScheduler;

/// Result of submitting a mutating payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// Server confirmed success
  Delivered,
  /// Network unreachable; persisted for a later drain
  Queued(String),
}

/// Namespaces currently stored, with the active pair.
#[derive(Debug)]
pub struct NamespaceListing {
  pub all: BTreeSet<String>,
  pub active_assets: Option<String>,
  pub active_api: Option<String>,
}

/// Relay wired to its storage, network, and queue.
pub struct Relay<S: CacheStorage> {
  config: Config,
  origin: Url,
  storage: Arc<S>,
  network: Arc<dyn Network>,
  generations: Arc<Generations<S>>,
  router: CacheRouter<S>,
  queue: Arc<RetryQueue>,
  submitter: Arc<dyn Submitter>,
  scheduler: SyncScheduler,
}

impl Relay<SqliteStorage> {
  /// Open persistent stores under `data_dir` and the HTTP transport.
  pub fn open(config: Config, data_dir: &Path) -> RelayResult<Self> {
    let origin = parse_origin(&config)?;
    let storage = Arc::new(SqliteStorage::open(&data_dir.join("cache.db"))?);
    let queue = Arc::new(RetryQueue::open(&data_dir.join("queue.db"))?);

    let http = HttpNetwork::new(config.network.timeout())?;
    let endpoint = origin
      .join(&config.sync.endpoint)
      .map_err(|e| RelayError::Config(format!("Invalid sync endpoint: {}", e)))?;
    let submitter = Arc::new(HttpSubmitter::new(http.clone(), endpoint));

    Self::with_parts(config, storage, Arc::new(http), queue, submitter)
  }
}

impl<S: CacheStorage> Relay<S> {
  pub fn with_parts(
    config: Config,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    queue: Arc<RetryQueue>,
    submitter: Arc<dyn Submitter>,
  ) -> RelayResult<Self> {
    let origin = parse_origin(&config)?;
    let generations = Arc::new(Generations::load(Arc::clone(&storage))?);
    generations.ensure_api(&config.cache.api_namespace)?;
    let router = CacheRouter::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      Arc::clone(&generations),
      RequestClassifier::from_config(&config.cache),
    );
    let scheduler = SyncScheduler::new(
      Arc::clone(&queue),
      Arc::clone(&submitter),
      config.sync.topic.clone(),
    );

    Ok(Self {
      config,
      origin,
      storage,
      network,
      generations,
      router,
      queue,
      submitter,
      scheduler,
    })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn scheduler(&self) -> &SyncScheduler {
    &self.scheduler
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, target: &str) -> RelayResult<Url> {
    self
      .origin
      .join(target)
      .map_err(|e| RelayError::Config(format!("Invalid URL {}: {}", target, e)))
  }

  /// Serve one outgoing request.
  pub async fn intercept(&self, request: FetchRequest) -> RelayResult<CacheResult> {
    self.router.handle(request).await
  }

  /// Install the configured version's generation.
  pub async fn install(&self) -> RelayResult<InstalledGeneration> {
    self
      .generations
      .install(
        self.network.as_ref(),
        &self.origin,
        &self.config.cache.asset_namespace(),
        &self.config.cache.critical_assets,
      )
      .await
  }

  /// Activate the configured version, which must already be installed.
  pub fn activate(&self) -> RelayResult<ActivationReport> {
    let namespace = self.config.cache.asset_namespace();
    let installed = self.generations.installed(&namespace)?.ok_or_else(|| {
      RelayError::Config(format!(
        "Generation {} is not installed; run install first",
        namespace
      ))
    })?;
    self
      .generations
      .activate(&installed, &self.config.cache.api_namespace)
  }

  /// Install then activate. The previous generation stays active if the
  /// install fails.
  pub async fn deploy(&self) -> RelayResult<ActivationReport> {
    let installed = self.install().await?;
    self
      .generations
      .activate(&installed, &self.config.cache.api_namespace)
  }

  pub fn namespaces(&self) -> RelayResult<NamespaceListing> {
    Ok(NamespaceListing {
      all: self.storage.list_namespaces()?,
      active_assets: self
        .generations
        .active(Slot::Assets)
        .map(|h| h.namespace().to_string()),
      active_api: self
        .generations
        .active(Slot::Api)
        .map(|h| h.namespace().to_string()),
    })
  }

  /// Deliver a mutating payload now, or queue it if the network is down.
  ///
  /// A server error is returned to the caller: the server answered, so the
  /// operation is not retried blindly.
  pub async fn submit(&self, payload: Vec<u8>) -> RelayResult<SubmitOutcome> {
    let operation = PendingOperation::new(payload);

    match self.submitter.submit(&operation).await {
      Ok(()) => Ok(SubmitOutcome::Delivered),
      Err(e) if e.is_network_failure() => {
        let id = self.queue.push(operation)?;
        warn!(%id, error = %e, "Submission failed, queued for background sync");
        Ok(SubmitOutcome::Queued(id))
      }
      Err(e) => Err(e),
    }
  }

  pub fn enqueue(&self, payload: Vec<u8>) -> RelayResult<String> {
    let id = self.queue.enqueue(payload)?;
    info!(%id, "Operation queued");
    Ok(id)
  }

  pub fn pending(&self) -> RelayResult<Vec<PendingOperation>> {
    self.queue.peek_all()
  }
}

fn parse_origin(config: &Config) -> RelayResult<Url> {
  Url::parse(&config.origin)
    .map_err(|e| RelayError::Config(format!("Invalid origin {}: {}", config.origin, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::classify::RequestClass;
  use crate::net::testing::FakeNetwork;
  use crate::queue::testing::FakeSubmitter;
  use crate::request::Destination;

  struct Fixture {
    network: Arc<FakeNetwork>,
    submitter: Arc<FakeSubmitter>,
    relay: Relay<SqliteStorage>,
  }

  fn fixture(config: Config) -> Fixture {
    let network = Arc::new(FakeNetwork::serving_ok());
    let submitter = Arc::new(FakeSubmitter::accepting());
    let relay = Relay::with_parts(
      config,
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::clone(&network) as Arc<dyn Network>,
      Arc::new(RetryQueue::open_in_memory().unwrap()),
      Arc::clone(&submitter) as Arc<dyn Submitter>,
    )
    .unwrap();
    Fixture {
      network,
      submitter,
      relay,
    }
  }

  #[tokio::test]
  async fn deploy_serves_critical_assets_offline() {
    let f = fixture(Config::default());
    f.relay.deploy().await.unwrap();
    f.network.set_offline(true);

    for path in Config::default().cache.critical_assets {
      let request = FetchRequest::get(f.relay.resolve(&path).unwrap());
      let served = f.relay.intercept(request).await.unwrap();
      assert_eq!(served.class, RequestClass::CriticalAsset);
      assert_eq!(served.source, CacheSource::Cache);
    }
  }

  #[tokio::test]
  async fn version_bump_evicts_previous_deployment() {
    let f = fixture(Config::default());
    f.relay.deploy().await.unwrap();

    let mut next = Config::default();
    next.cache.version = "v3.3.0".to_string();
    let relay = Relay::with_parts(
      next,
      Arc::clone(&f.relay.storage),
      Arc::clone(&f.network) as Arc<dyn Network>,
      Arc::clone(&f.relay.queue),
      Arc::clone(&f.submitter) as Arc<dyn Submitter>,
    )
    .unwrap();
    relay.deploy().await.unwrap();

    let listing = relay.namespaces().unwrap();
    let names: Vec<_> = listing.all.into_iter().collect();
    assert_eq!(
      names,
      vec!["armffsoft-api-v1".to_string(), "armffsoft-v3.3.0".to_string()]
    );
    assert_eq!(listing.active_assets.as_deref(), Some("armffsoft-v3.3.0"));
  }

  #[tokio::test]
  async fn activate_requires_completed_install() {
    let f = fixture(Config::default());
    assert!(matches!(f.relay.activate(), Err(RelayError::Config(_))));

    f.relay.install().await.unwrap();
    f.relay.activate().unwrap();
    assert!(f.relay.namespaces().unwrap().active_assets.is_some());
  }

  #[tokio::test]
  async fn products_online_then_offline() {
    let f = fixture(Config::default());
    f.relay.deploy().await.unwrap();
    let products = FetchRequest::get(f.relay.resolve("/api/products").unwrap());

    let online = f.relay.intercept(products.clone()).await.unwrap();
    assert_eq!(online.source, CacheSource::Network);

    f.network.set_offline(true);
    let offline = f.relay.intercept(products).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.entry, online.entry);
  }

  #[tokio::test]
  async fn products_fall_back_offline_before_any_deploy() {
    let f = fixture(Config::default());
    let products = FetchRequest::get(f.relay.resolve("/api/products").unwrap())
      .with_header("Accept", "application/json");

    let online = f.relay.intercept(products.clone()).await.unwrap();
    assert_eq!(online.source, CacheSource::Network);

    f.network.set_offline(true);
    let offline = f.relay.intercept(products).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.entry.body, online.entry.body);

    let listing = f.relay.namespaces().unwrap();
    assert_eq!(listing.active_api.as_deref(), Some("armffsoft-api-v1"));
    assert_eq!(listing.active_assets, None);
  }

  #[tokio::test]
  async fn deployed_document_is_served_offline_with_browser_headers() {
    let f = fixture(Config::default());
    f.relay.deploy().await.unwrap();
    f.network.set_offline(true);

    let home = FetchRequest::get(f.relay.resolve("/").unwrap())
      .with_destination(Destination::Document)
      .with_header("Accept", "text/html")
      .with_header("Accept-Language", "en-US");
    let served = f.relay.intercept(home).await.unwrap();

    assert_eq!(served.class, RequestClass::CriticalAsset);
    assert_eq!(served.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn offline_submission_is_queued_and_drained_later() {
    let f = fixture(Config::default());
    f.submitter.set_offline(true);

    let outcome = f.relay.submit(br#"{"intent":"pi_1"}"#.to_vec()).await.unwrap();
    let id = match outcome {
      SubmitOutcome::Queued(id) => id,
      other => panic!("expected queued, got {other:?}"),
    };
    assert_eq!(f.relay.pending().unwrap()[0].id, id);

    f.submitter.set_offline(false);
    let report = f
      .relay
      .scheduler()
      .trigger("background-payment")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(f.relay.pending().unwrap().is_empty());
    assert_eq!(f.submitter.delivered(), vec![id]);
  }

  #[tokio::test]
  async fn server_rejection_is_not_queued() {
    let f = fixture(Config::default());
    f.submitter.fail_payload(b"bad");

    let err = f.relay.submit(b"bad".to_vec()).await.unwrap_err();
    assert!(matches!(err, RelayError::ServerError { status: 502, .. }));
    assert!(f.relay.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn static_image_uses_cache_first() {
    let f = fixture(Config::default());
    f.relay.deploy().await.unwrap();
    let image =
      FetchRequest::get(f.relay.resolve("/img/p1.webp").unwrap()).with_destination(Destination::Image);

    assert_eq!(
      f.relay.intercept(image.clone()).await.unwrap().source,
      CacheSource::Network
    );
    assert_eq!(
      f.relay.intercept(image).await.unwrap().source,
      CacheSource::Cache
    );
  }
}
