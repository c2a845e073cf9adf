//! Core types for cached responses and where they came from.

use chrono::{DateTime, Utc};

use crate::classify::RequestClass;

/// Immutable snapshot of a response.
///
/// Replacing an entry means putting a new snapshot at the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl ResourceEntry {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
      stored_at: Utc::now(),
    }
  }

  /// Whether this response may be written to a cache generation.
  ///
  /// Partial content is excluded since it is not a complete representation.
  pub fn is_cacheable(&self) -> bool {
    (200..300).contains(&self.status) && self.status != 206
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Opaque reference to one stored generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationHandle {
  namespace: String,
}

impl GenerationHandle {
  pub(crate) fn new(namespace: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }
}

/// A routed response together with its provenance.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The response handed to the caller
  pub entry: ResourceEntry,
  /// Where the response came from
  pub source: CacheSource,
  /// Class the request was routed as
  pub class: RequestClass,
}

impl CacheResult {
  pub fn from_network(entry: ResourceEntry, class: RequestClass) -> Self {
    Self {
      entry,
      source: CacheSource::Network,
      class,
    }
  }

  pub fn from_cache(entry: ResourceEntry, class: RequestClass) -> Self {
    Self {
      entry,
      source: CacheSource::Cache,
      class,
    }
  }

  /// Network unreachable, serving the stored copy.
  pub fn offline(entry: ResourceEntry, class: RequestClass) -> Self {
    Self {
      entry,
      source: CacheSource::Offline,
      class,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from the network
  Network,
  /// Cache hit on a cache-first request
  Cache,
  /// Network failed, serving the stored copy
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheSource::Network => write!(f, "network"),
      CacheSource::Cache => write!(f, "cache"),
      CacheSource::Offline => write!(f, "offline-fallback"),
    }
  }
}
