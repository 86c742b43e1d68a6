//! Records, options and results of the caching system.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::key::CacheKey;

/// Metadata sidecar persisted next to each payload (`meta_<hash>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
  /// Creation time, Unix milliseconds.
  pub timestamp: i64,
  /// Time-to-live in milliseconds.
  pub max_age: u64,
  pub endpoint: String,
  pub params_fingerprint: String,
}

impl CacheMetadata {
  pub fn age_ms(&self, now_ms: i64) -> i64 {
    now_ms.saturating_sub(self.timestamp)
  }

  /// Strictly older than `max_age`; a record exactly `max_age` old is still fresh.
  /// A timestamp in the future counts as fresh.
  pub fn is_expired(&self, now_ms: i64) -> bool {
    u64::try_from(self.age_ms(now_ms)).map_or(false, |age| age > self.max_age)
  }
}

/// A cached payload with its metadata. Only ever replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
  pub key: CacheKey,
  pub payload: Vec<u8>,
  pub metadata: CacheMetadata,
}

impl CacheRecord {
  pub fn created_at_ms(&self) -> i64 {
    self.metadata.timestamp
  }

  pub fn max_age(&self) -> Duration {
    Duration::from_millis(self.metadata.max_age)
  }
}

/// Options for a tiered cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
  /// Treat records older than their TTL as a miss (and purge them).
  pub check_expiry: bool,
  /// Always miss.
  pub force_refresh: bool,
}

impl Default for GetOptions {
  fn default() -> Self {
    Self {
      check_expiry: true,
      force_refresh: false,
    }
  }
}

impl GetOptions {
  /// Accept stale records.
  pub fn allow_stale() -> Self {
    Self {
      check_expiry: false,
      force_refresh: false,
    }
  }
}

/// Diagnostic counters. Not consistency-affecting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
  /// Records in the persistent tier.
  pub total_items: usize,
  /// Records mirrored in the memory tier.
  pub memory_items: usize,
  pub average_age_ms: f64,
}

impl CacheStats {
  pub fn average_age_minutes(&self) -> u64 {
    (self.average_age_ms / 60_000.0).round() as u64
  }

  pub fn average_age_hours(&self) -> u64 {
    (self.average_age_ms / 3_600_000.0).round() as u64
  }
}

/// Result of a read, including data and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache), Unix milliseconds
  pub cached_at_ms: Option<i64>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at_ms: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at_ms: i64, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at_ms: Some(cached_at_ms),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at_ms: i64) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at_ms: Some(cached_at_ms),
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at_ms: self.cached_at_ms,
    }
  }

  pub fn is_from_network(&self) -> bool {
    self.source == CacheSource::Network
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its TTL, served because the network fetch failed
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

impl CacheSource {
  pub fn label(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache",
      CacheSource::CacheStale => "cache (stale)",
      CacheSource::Offline => "offline cache",
    }
  }
}
