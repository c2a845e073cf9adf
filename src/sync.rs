//! External triggers that drain the retry queue.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::RelayResult;
use crate::queue::{DrainReport, RetryQueue, Submitter};

/// Wires connectivity and periodic signals to [`RetryQueue::drain`].
///
/// The scheduler never retries on its own inside a pass; every drain is one
/// pass started by a signal.
pub struct SyncScheduler {
  queue: Arc<RetryQueue>,
  submitter: Arc<dyn Submitter>,
  topic: String,
  online: AtomicBool,
}

impl SyncScheduler {
  pub fn new(queue: Arc<RetryQueue>, submitter: Arc<dyn Submitter>, topic: impl Into<String>) -> Self {
    Self {
      queue,
      submitter,
      topic: topic.into(),
      online: AtomicBool::new(false),
    }
  }

  pub fn topic(&self) -> &str {
    &self.topic
  }

  /// Drain if `topic` is the retry topic. Other topics are ignored.
  pub async fn trigger(&self, topic: &str) -> RelayResult<Option<DrainReport>> {
    if topic != self.topic {
      debug!(topic, expected = %self.topic, "Ignoring trigger for unknown topic");
      return Ok(None);
    }
    self.queue.drain(self.submitter.as_ref()).await.map(Some)
  }

  /// Record a connectivity observation; drains when it flips to online.
  pub async fn connectivity_changed(&self, online: bool) -> RelayResult<Option<DrainReport>> {
    let was_online = self.online.swap(online, Ordering::AcqRel);
    if online && !was_online {
      info!("Connectivity regained, draining retry queue");
      return self.trigger(&self.topic).await;
    }
    if !online && was_online {
      info!("Connectivity lost");
    }
    Ok(None)
  }

  /// Probe connectivity every `interval` until `shutdown` resolves.
  ///
  /// Drains when connectivity is regained and on every tick while online.
  pub async fn run<P, Fut, S>(&self, interval: Duration, probe: P, shutdown: S)
  where
    P: Fn() -> Fut,
    Fut: Future<Output = bool>,
    S: Future<Output = ()>,
  {
    let mut ticker = tokio::time::interval(interval);
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!("Sync scheduler stopping");
          break;
        }
        _ = ticker.tick() => {
          let online = probe().await;
          let was_online = self.online.load(Ordering::Acquire);

          let result = if online && was_online {
            self.trigger(&self.topic).await
          } else {
            self.connectivity_changed(online).await
          };
          if let Err(e) = result {
            warn!(error = %e, "Scheduled drain failed");
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::testing::FakeSubmitter;

  fn scheduler() -> (Arc<RetryQueue>, Arc<FakeSubmitter>, SyncScheduler) {
    let queue = Arc::new(RetryQueue::open_in_memory().unwrap());
    let submitter = Arc::new(FakeSubmitter::accepting());
    let scheduler = SyncScheduler::new(
      Arc::clone(&queue),
      Arc::clone(&submitter) as Arc<dyn Submitter>,
      "background-payment",
    );
    (queue, submitter, scheduler)
  }

  #[tokio::test]
  async fn only_the_retry_topic_drains() {
    let (queue, _submitter, scheduler) = scheduler();
    queue.enqueue(b"pay".to_vec()).unwrap();

    assert!(scheduler.trigger("newsletter").await.unwrap().is_none());
    assert_eq!(queue.len().unwrap(), 1);

    let report = scheduler.trigger("background-payment").await.unwrap().unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn drains_only_on_offline_to_online_transition() {
    let (queue, _submitter, scheduler) = scheduler();
    queue.enqueue(b"pay".to_vec()).unwrap();

    assert!(scheduler.connectivity_changed(false).await.unwrap().is_none());
    assert_eq!(queue.len().unwrap(), 1);

    let report = scheduler.connectivity_changed(true).await.unwrap();
    assert_eq!(report.unwrap().succeeded, 1);

    queue.enqueue(b"later".to_vec()).unwrap();
    assert!(scheduler.connectivity_changed(true).await.unwrap().is_none());
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn run_drains_when_probe_reports_online() {
    let (queue, submitter, scheduler) = scheduler();
    queue.enqueue(b"pay".to_vec()).unwrap();
    let online = Arc::new(AtomicBool::new(false));

    let probe = {
      let online = Arc::clone(&online);
      move || {
        let online = Arc::clone(&online);
        async move { online.load(Ordering::SeqCst) }
      }
    };
    let shutdown = {
      let queue = Arc::clone(&queue);
      let online = Arc::clone(&online);
      async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.len().unwrap(), 1);
        online.store(true, Ordering::SeqCst);
        while !queue.is_empty().unwrap() {
          tokio::time::sleep(Duration::from_millis(5)).await;
        }
      }
    };

    tokio::time::timeout(
      Duration::from_secs(2),
      scheduler.run(Duration::from_millis(5), probe, shutdown),
    )
    .await
    .expect("scheduler did not stop");

    assert_eq!(submitter.delivered().len(), 1);
  }
}
