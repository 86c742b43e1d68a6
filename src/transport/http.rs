//! reqwest-backed transport.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use super::{Method, Transport, TransportError, TransportRequest, TransportResponse};

/// HTTP client wrapper
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: String,
  default_headers: BTreeMap<String, String>,
}

impl HttpTransport {
  pub fn new(
    base_url: &str,
    timeout: Duration,
    default_headers: BTreeMap<String, String>,
  ) -> Result<Self, TransportError> {
    // Validate once so every request can assume a well-formed base
    Url::parse(base_url)
      .map_err(|e| TransportError::other(format!("Invalid base URL {}: {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::other(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      default_headers,
    })
  }

  /// Absolute URL for `request`, with its params as the query string.
  fn url_for(&self, request: &TransportRequest) -> Result<Url, TransportError> {
    let raw = format!(
      "{}/{}",
      self.base_url,
      request.endpoint.trim_start_matches('/')
    );
    let mut url = Url::parse(&raw)
      .map_err(|e| TransportError::other(format!("Invalid URL {}: {}", raw, e)))?;

    if !request.params.is_empty() {
      let mut query = url.query_pairs_mut();
      for (name, value) in request.params.iter() {
        query.append_pair(name, &query_value(value));
      }
    }

    Ok(url)
  }

  async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
    let url = self.url_for(&request)?;
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, url);
    for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(payload) = request.payload {
      builder = builder
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(payload);
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(map_reqwest_error)?;

    TransportResponse {
      status,
      body: body.to_vec(),
    }
    .error_for_status()
  }

  /// Reachability check. Any HTTP answer, even an error status, means online.
  pub async fn ping(&self, endpoint: &str) -> bool {
    match self.send(TransportRequest::new(Method::Get, endpoint)).await {
      Ok(_) => true,
      Err(e) => e.code().is_some(),
    }
  }
}

impl Transport for HttpTransport {
  fn perform(
    &self,
    request: TransportRequest,
  ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
    self.send(request).boxed()
  }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::timeout(e.to_string())
  } else if e.is_connect() {
    TransportError::connection(e.to_string())
  } else if let Some(status) = e.status() {
    TransportError::status(status.as_u16(), e.to_string())
  } else if e.is_request() || e.is_body() {
    TransportError::connection(e.to_string())
  } else {
    TransportError::other(e.to_string())
  }
}

/// Strings go out bare, everything else as JSON text.
fn query_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
