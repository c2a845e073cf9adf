//! Outbound network access.

mod client;

pub use client::{HttpNetwork, HttpSubmitter};

use async_trait::async_trait;

use crate::cache::ResourceEntry;
use crate::error::RelayResult;
use crate::request::FetchRequest;

/// Performs one request/response exchange.
///
/// Any response obtained is `Ok`, whatever its status. `Err` means no
/// response arrived (connection failure or timeout).
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &FetchRequest) -> RelayResult<ResourceEntry>;
}
