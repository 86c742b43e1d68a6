//! Error types shared by the cache, the queue and the client.

use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
  /// The network call failed (after local retries, where applicable).
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// No connectivity and nothing usable in the cache.
  #[error("offline and no cached data for {endpoint}")]
  Offline { endpoint: String },

  /// A durable append/update/remove of the operation queue failed.
  /// The in-memory queue is left as it was before the call.
  #[error("failed to persist operation queue: {0}")]
  QueuePersistence(String),

  /// A stored cache record could not be decoded.
  #[error("corrupt cache record {key}")]
  CacheCorruption { key: String },

  /// The key/value store itself failed.
  #[error("storage error: {0}")]
  Storage(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("no operation with id {id}")]
  UnknownOperation { id: String },
}

impl Error {
  /// True for the offline-no-data case, so a UI can show an offline indicator
  /// instead of a generic failure.
  pub fn is_offline(&self) -> bool {
    matches!(self, Error::Offline { .. })
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, Error::Transport(e) if e.is_timeout())
  }

  pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
    Error::Storage(e.to_string())
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Storage(e.to_string())
  }
}
