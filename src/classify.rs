//! Request classification.

use crate::config::CacheConfig;
use crate::request::{Destination, FetchRequest};

/// Caching class of a request. Each class maps to one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  CriticalAsset,
  ApiEndpoint,
  StaticAsset,
  Other,
}

impl std::fmt::Display for RequestClass {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RequestClass::CriticalAsset => write!(f, "critical-asset"),
      RequestClass::ApiEndpoint => write!(f, "api-endpoint"),
      RequestClass::StaticAsset => write!(f, "static-asset"),
      RequestClass::Other => write!(f, "other"),
    }
  }
}

/// Maps requests to a [`RequestClass`] using the configured path lists.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
  critical_assets: Vec<String>,
  api_endpoints: Vec<String>,
}

impl RequestClassifier {
  pub fn new(critical_assets: Vec<String>, api_endpoints: Vec<String>) -> Self {
    Self {
      critical_assets,
      api_endpoints,
    }
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(config.critical_assets.clone(), config.api_endpoints.clone())
  }

  /// Classify a request. Never fails; unmatched input is `Other`.
  ///
  /// Priority: exact critical-asset path, then API prefix, then declared
  /// destination.
  pub fn classify(&self, request: &FetchRequest) -> RequestClass {
    let path = request.path();

    if self.critical_assets.iter().any(|p| p == path) {
      return RequestClass::CriticalAsset;
    }

    if self.api_endpoints.iter().any(|p| path.starts_with(p.as_str())) {
      return RequestClass::ApiEndpoint;
    }

    match request.destination {
      Destination::Style | Destination::Script | Destination::Font | Destination::Image => {
        RequestClass::StaticAsset
      }
      Destination::Document | Destination::Empty => RequestClass::Other,
    }
  }
}
