//! Error kinds surfaced by the relay.
//!
//! Each kind maps to one degradation path: storage problems fall back to the
//! network, network failures fall back to the cache, server errors are handed
//! back to the caller untouched, and corrupt queue rows are dropped.

/// Errors produced by the cache, router, and retry queue.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
  #[error("Storage unavailable: {0}")]
  StorageUnavailable(String),

  #[error("Network failure: {0}")]
  NetworkFailure(String),

  #[error("Server error ({status}): {body}")]
  ServerError { status: u16, body: String },

  #[error("Corrupt queue entry {id}: {reason}")]
  QueueCorrupt { id: String, reason: String },

  #[error("Install failed while seeding {path}: {source}")]
  InstallFailed {
    path: String,
    #[source]
    source: Box<RelayError>,
  },

  #[error("Configuration error: {0}")]
  Config(String),
}

impl RelayError {
  /// Whether this error should trigger a cache fallback.
  ///
  /// Only a missing response counts; a server that answered with a failure
  /// status is not a fallback trigger.
  pub fn is_network_failure(&self) -> bool {
    matches!(self, RelayError::NetworkFailure(_))
  }

  /// Build a storage error from anything displayable.
  pub fn storage(err: impl std::fmt::Display) -> Self {
    RelayError::StorageUnavailable(err.to_string())
  }
}

impl From<rusqlite::Error> for RelayError {
  fn from(err: rusqlite::Error) -> Self {
    RelayError::StorageUnavailable(err.to_string())
  }
}

impl From<reqwest::Error> for RelayError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      RelayError::NetworkFailure(format!("timed out: {}", err))
    } else {
      RelayError::NetworkFailure(err.to_string())
    }
  }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
