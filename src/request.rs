//! Request descriptors and the cache identity derived from them.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Declared resource type of an outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  Style,
  Script,
  Font,
  Image,
  Document,
  #[default]
  Empty,
}

impl FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "style" => Ok(Destination::Style),
      "script" => Ok(Destination::Script),
      "font" => Ok(Destination::Font),
      "image" => Ok(Destination::Image),
      "document" => Ok(Destination::Document),
      "" | "empty" => Ok(Destination::Empty),
      other => Err(format!("unknown destination '{}'", other)),
    }
  }
}

/// An outgoing request as seen by the relay.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub destination: Destination,
  pub body: Option<Vec<u8>>,
}

impl FetchRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: Vec::new(),
      destination: Destination::Empty,
      body: None,
    }
  }

  #[cfg(test)]
  pub fn post(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: "POST".to_string(),
      url,
      headers: Vec::new(),
      destination: Destination::Empty,
      body: Some(body),
    }
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// Only GET responses are stored by any strategy.
  pub fn is_cacheable_method(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  pub fn resource_key(&self) -> ResourceKey {
    ResourceKey::for_request(self)
  }
}

/// Deterministic cache identity of a request: method plus normalized URL.
///
/// Request headers are not part of the key, so a stored response matches any
/// request for the same URL whatever it negotiates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey(String);

impl ResourceKey {
  fn for_request(request: &FetchRequest) -> Self {
    let input = format!(
      "{}\n{}",
      request.method.to_ascii_uppercase(),
      normalize_url(&request.url)
    );

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  #[cfg(test)]
  pub fn from_raw(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Drop the fragment; `Url` already lowercases scheme and host and strips
/// default ports.
fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}
