//! The network contract the client dispatches through.

mod http;

pub use http::HttpTransport;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::cache::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
  pub method: Method,
  pub endpoint: String,
  /// Sent as the query string.
  pub params: Params,
  pub payload: Option<Vec<u8>>,
  pub headers: BTreeMap<String, String>,
}

impl TransportRequest {
  pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
    Self {
      method,
      endpoint: endpoint.into(),
      params: Params::new(),
      payload: None,
      headers: BTreeMap::new(),
    }
  }

  pub fn with_params(mut self, params: Params) -> Self {
    self.params = params;
    self
  }

  pub fn with_payload(mut self, payload: Option<Vec<u8>>) -> Self {
    self.payload = payload;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl TransportResponse {
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self {
      status: 200,
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Turn a non-2xx response into a `Status` error.
  pub fn error_for_status(self) -> Result<Self, TransportError> {
    if self.is_success() {
      Ok(self)
    } else {
      let message: String = String::from_utf8_lossy(&self.body).chars().take(200).collect();
      Err(TransportError::status(self.status, message))
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
  /// The request did not complete in time.
  Timeout,
  /// The server could not be reached.
  Connection,
  /// The server answered with a non-success status.
  Status(u16),
  Other,
}

impl fmt::Display for TransportErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TransportErrorKind::Timeout => f.write_str("timeout"),
      TransportErrorKind::Connection => f.write_str("connection failed"),
      TransportErrorKind::Status(code) => write!(f, "HTTP {}", code),
      TransportErrorKind::Other => f.write_str("transport error"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
  pub kind: TransportErrorKind,
  pub message: String,
}

impl TransportError {
  pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(TransportErrorKind::Timeout, message)
  }

  pub fn connection(message: impl Into<String>) -> Self {
    Self::new(TransportErrorKind::Connection, message)
  }

  pub fn status(code: u16, message: impl Into<String>) -> Self {
    Self::new(TransportErrorKind::Status(code), message)
  }

  pub fn other(message: impl Into<String>) -> Self {
    Self::new(TransportErrorKind::Other, message)
  }

  /// HTTP status code, if the server answered.
  pub fn code(&self) -> Option<u16> {
    match self.kind {
      TransportErrorKind::Status(code) => Some(code),
      _ => None,
    }
  }

  pub fn is_timeout(&self) -> bool {
    self.kind == TransportErrorKind::Timeout
  }

  /// Worth retrying: timeouts, unreachable servers, and 408/429/5xx answers.
  pub fn is_transient(&self) -> bool {
    match self.kind {
      TransportErrorKind::Timeout | TransportErrorKind::Connection => true,
      TransportErrorKind::Status(code) => code == 408 || code == 429 || code >= 500,
      TransportErrorKind::Other => false,
    }
  }
}

/// Performs one request. Implementations must not retry on their own.
pub trait Transport: Send + Sync {
  fn perform(
    &self,
    request: TransportRequest,
  ) -> BoxFuture<'_, Result<TransportResponse, TransportError>>;
}
