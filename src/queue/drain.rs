//! One-pass delivery of queued operations.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::store::{PendingOperation, RetryQueue};
use crate::error::RelayResult;

/// Delivers one queued operation. `Ok` means the server confirmed success.
#[async_trait]
pub trait Submitter: Send + Sync {
  async fn submit(&self, operation: &PendingOperation) -> RelayResult<()>;
}

/// Summary of a drain pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
  pub corrupt_removed: usize,
  /// Another drain was already running; this call did nothing
  pub coalesced: bool,
}

/// Releases the drain lease and clears the draining flag when the pass ends,
/// including on early return.
struct DrainGuard<'a> {
  queue: &'a RetryQueue,
  leased: bool,
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    if self.leased {
      if let Err(e) = self.queue.release_lease() {
        warn!(error = %e, "Failed to release drain lease");
      }
    }
    self.queue.draining.store(false, Ordering::Release);
  }
}

fn coalesced() -> DrainReport {
  DrainReport {
    coalesced: true,
    ..DrainReport::default()
  }
}

impl RetryQueue {
  /// Attempt every queued operation once, oldest first.
  ///
  /// Confirmed successes are removed; failures stay in place with their
  /// attempt count bumped and do not stop the pass. Corrupt rows are dropped.
  /// A call made while another pass is running on the same queue file, from
  /// this process or another one, returns immediately.
  pub async fn drain(&self, submitter: &dyn Submitter) -> RelayResult<DrainReport> {
    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("Drain already in progress, coalescing");
      return Ok(coalesced());
    }
    let mut guard = DrainGuard {
      queue: self,
      leased: false,
    };
    if !self.acquire_lease()? {
      debug!("Drain lease held by another queue handle, coalescing");
      return Ok(coalesced());
    }
    guard.leased = true;

    let mut report = DrainReport::default();
    for row in self.scan()? {
      // Renew; another handle may have taken over an expired lease
      if !self.acquire_lease()? {
        warn!("Drain lease lost, stopping pass");
        break;
      }

      let mut operation = match row {
        Ok(op) => op,
        Err(corrupt) => {
          warn!(seq = corrupt.seq, error = %corrupt.error, "Removing corrupt queue row");
          match self.remove_seq(corrupt.seq) {
            Ok(()) => report.corrupt_removed += 1,
            Err(e) => warn!(seq = corrupt.seq, error = %e, "Failed to remove corrupt row"),
          }
          continue;
        }
      };

      report.attempted += 1;
      match submitter.submit(&operation).await {
        Ok(()) => {
          report.succeeded += 1;
          // Left in place if this fails; the next pass resubmits it.
          if let Err(e) = self.remove(&operation.id) {
            warn!(id = %operation.id, error = %e, "Delivered operation could not be removed");
          }
        }
        Err(e) => {
          report.failed += 1;
          warn!(
            id = %operation.id,
            attempt = operation.attempt_count + 1,
            error = %e,
            "Queued operation failed"
          );
          if let Err(store_err) = self.record_failure(&mut operation, &e) {
            warn!(id = %operation.id, error = %store_err, "Failed to record attempt");
          }
        }
      }
    }

    info!(
      attempted = report.attempted,
      succeeded = report.succeeded,
      failed = report.failed,
      corrupt_removed = report.corrupt_removed,
      "Drain pass complete"
    );
    Ok(report)
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted submitter for drain tests.

  use super::*;
  use crate::error::RelayError;
  use std::collections::HashSet;
  use std::sync::Mutex;
  use tokio::sync::Notify;

  #[derive(Default)]
  pub struct FakeSubmitter {
    failing: Mutex<HashSet<Vec<u8>>>,
    offline: AtomicBool,
    delivered: Mutex<Vec<String>>,
    gate: Option<std::sync::Arc<Notify>>,
  }

  impl FakeSubmitter {
    pub fn accepting() -> Self {
      Self::default()
    }

    /// Waits on `gate` before answering each submission.
    pub fn gated(gate: std::sync::Arc<Notify>) -> Self {
      Self {
        gate: Some(gate),
        ..Self::default()
      }
    }

    pub fn fail_payload(&self, payload: &[u8]) {
      self.failing.lock().unwrap().insert(payload.to_vec());
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<String> {
      self.delivered.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Submitter for FakeSubmitter {
    async fn submit(&self, operation: &PendingOperation) -> RelayResult<()> {
      if let Some(gate) = &self.gate {
        gate.notified().await;
      }
      if self.offline.load(Ordering::SeqCst) {
        return Err(RelayError::NetworkFailure("offline".into()));
      }
      if self.failing.lock().unwrap().contains(&operation.payload) {
        return Err(RelayError::ServerError {
          status: 502,
          body: "bad gateway".into(),
        });
      }
      self.delivered.lock().unwrap().push(operation.id.clone());
      Ok(())
    }
  }
}
