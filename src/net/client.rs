use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::Network;
use crate::cache::ResourceEntry;
use crate::error::{RelayError, RelayResult};
use crate::queue::{PendingOperation, Submitter};
use crate::request::FetchRequest;

/// HTTP transport backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> RelayResult<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client })
  }

  /// Cheap reachability probe: any response at all means online.
  pub async fn probe(&self, origin: &Url) -> bool {
    self.client.head(origin.clone()).send().await.is_ok()
  }

  async fn send(
    &self,
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    body: Option<&[u8]>,
  ) -> RelayResult<ResourceEntry> {
    let method = Method::from_bytes(method.as_bytes())
      .map_err(|e| RelayError::Config(format!("Invalid method {}: {}", method, e)))?;

    let mut builder = self
      .client
      .request(method, url.clone())
      .headers(to_header_map(headers)?);
    if let Some(body) = body {
      builder = builder.body(body.to_vec());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
      .collect();
    let body = response.bytes().await?.to_vec();

    debug!(%url, status, bytes = body.len(), "Network response");
    Ok(ResourceEntry::new(status, headers, body))
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &FetchRequest) -> RelayResult<ResourceEntry> {
    self
      .send(
        &request.method,
        &request.url,
        &request.headers,
        request.body.as_deref(),
      )
      .await
  }
}

/// Delivers queued payloads to the retry endpoint.
#[derive(Clone)]
pub struct HttpSubmitter {
  network: HttpNetwork,
  endpoint: Url,
}

impl HttpSubmitter {
  pub fn new(network: HttpNetwork, endpoint: Url) -> Self {
    Self { network, endpoint }
  }
}

#[async_trait]
impl Submitter for HttpSubmitter {
  async fn submit(&self, operation: &PendingOperation) -> RelayResult<()> {
    let headers = [("content-type".to_string(), "application/json".to_string())];
    let response = self
      .network
      .send("POST", &self.endpoint, &headers, Some(operation.payload.as_slice()))
      .await?;

    if (200..300).contains(&response.status) {
      Ok(())
    } else {
      Err(RelayError::ServerError {
        status: response.status,
        body: String::from_utf8_lossy(&response.body).into_owned(),
      })
    }
  }
}

fn to_header_map(headers: &[(String, String)]) -> RelayResult<HeaderMap> {
  let mut map = HeaderMap::new();
  for (name, value) in headers {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| RelayError::Config(format!("Invalid header name {}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
      .map_err(|e| RelayError::Config(format!("Invalid header value: {}", e)))?;
    map.append(name, value);
  }
  Ok(map)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_map_keeps_repeated_headers() {
    let map = to_header_map(&[
      ("Accept".to_string(), "text/css".to_string()),
      ("accept".to_string(), "*/*".to_string()),
    ])
    .unwrap();
    assert_eq!(map.get_all("accept").iter().count(), 2);
  }

  #[test]
  fn invalid_header_is_rejected() {
    assert!(to_header_map(&[("bad header".to_string(), "x".to_string())]).is_err());
  }

  #[tokio::test]
  async fn unreachable_host_is_network_failure() {
    let network = HttpNetwork::new(Duration::from_millis(500)).unwrap();
    let request = FetchRequest::get(Url::parse("http://127.0.0.1:9/api/products").unwrap());

    let err = network.fetch(&request).await.unwrap_err();
    assert!(err.is_network_failure());
  }

  #[tokio::test]
  async fn silent_server_times_out_as_network_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      let (_socket, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let network = HttpNetwork::new(Duration::from_millis(100)).unwrap();
    let url = Url::parse(&format!("http://{}/api/products", addr)).unwrap();
    let err = network.fetch(&FetchRequest::get(url)).await.unwrap_err();

    assert!(err.is_network_failure());
    assert!(err.to_string().contains("timed out"));
    server.abort();
  }
}
