//! Two-tier cache: a process-local memory map in front of the persistent store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::key::{derive_key, CacheKey, Params, META_PREFIX, PAYLOAD_PREFIX};
use super::storage::KeyValueStore;
use super::types::{CacheMetadata, CacheRecord, CacheStats, GetOptions};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Used when a caller does not pass a TTL.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Read-through cache with TTL metadata.
///
/// Every record lives in the persistent store (payload under `cache_<hash>`,
/// metadata under `meta_<hash>`) and is mirrored in memory once written or read.
/// Eviction is TTL-only; nothing bounds the number of records.
pub struct TieredCache {
  store: Arc<dyn KeyValueStore>,
  memory: Arc<Mutex<HashMap<CacheKey, CacheRecord>>>,
  clock: Arc<dyn Clock>,
  default_max_age: Duration,
}

impl TieredCache {
  pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      memory: Arc::new(Mutex::new(HashMap::new())),
      clock,
      default_max_age: DEFAULT_MAX_AGE,
    }
  }

  /// Set the TTL applied when callers don't specify one.
  pub fn with_default_max_age(mut self, max_age: Duration) -> Self {
    self.default_max_age = max_age;
    self
  }

  pub fn default_max_age(&self) -> Duration {
    self.default_max_age
  }

  fn memory(&self) -> Result<MutexGuard<'_, HashMap<CacheKey, CacheRecord>>> {
    self
      .memory
      .lock()
      .map_err(|e| Error::storage(format!("Lock poisoned: {}", e)))
  }

  /// Store `payload` for `(endpoint, params)`, replacing any previous record.
  pub fn set(
    &self,
    endpoint: &str,
    params: &Params,
    payload: &[u8],
    max_age: Duration,
  ) -> Result<()> {
    let key = derive_key(endpoint, params);
    let metadata = CacheMetadata {
      timestamp: self.clock.now_ms(),
      max_age: u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX),
      endpoint: endpoint.to_string(),
      params_fingerprint: params.fingerprint(),
    };

    self.store.set_many(&[
      (key.payload_key(), payload.to_vec()),
      (key.meta_key(), serde_json::to_vec(&metadata)?),
    ])?;

    debug!(endpoint, key = %key, max_age_ms = metadata.max_age, "cache set");

    self.memory()?.insert(
      key.clone(),
      CacheRecord {
        key,
        payload: payload.to_vec(),
        metadata,
      },
    );

    Ok(())
  }

  /// Look up `(endpoint, params)`.
  ///
  /// With `check_expiry`, a record past its TTL is purged from both tiers and
  /// reported as a miss. Without it, stale records are returned as-is.
  pub fn get(
    &self,
    endpoint: &str,
    params: &Params,
    options: GetOptions,
  ) -> Result<Option<CacheRecord>> {
    if options.force_refresh {
      return Ok(None);
    }

    let key = derive_key(endpoint, params);
    let now = self.clock.now_ms();

    // Memory tier first
    let in_memory = self.memory()?.get(&key).cloned();
    if let Some(record) = in_memory {
      if options.check_expiry && record.metadata.is_expired(now) {
        debug!(endpoint, key = %key, "cache expired (memory)");
        self.purge(&key)?;
        return Ok(None);
      }
      debug!(endpoint, key = %key, "cache hit (memory)");
      return Ok(Some(record));
    }

    let record = match self.load(&key)? {
      Some(record) => record,
      None => {
        debug!(endpoint, key = %key, "cache miss");
        return Ok(None);
      }
    };

    if options.check_expiry && record.metadata.is_expired(now) {
      debug!(endpoint, key = %key, "cache expired (store)");
      self.purge(&key)?;
      return Ok(None);
    }

    debug!(endpoint, key = %key, "cache hit (store)");
    self.memory()?.insert(key, record.clone());
    Ok(Some(record))
  }

  /// Read a record from the persistent tier. Corrupt records are purged and
  /// reported as absent.
  fn load(&self, key: &CacheKey) -> Result<Option<CacheRecord>> {
    let payload = match self.store.get(&key.payload_key())? {
      Some(payload) => payload,
      None => return Ok(None),
    };

    match self.read_metadata(key) {
      Ok(metadata) => Ok(Some(CacheRecord {
        key: key.clone(),
        payload,
        metadata,
      })),
      Err(Error::CacheCorruption { .. }) => {
        warn!(key = %key, "corrupt cache record, purging");
        self.purge(key)?;
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  fn read_metadata(&self, key: &CacheKey) -> Result<CacheMetadata> {
    let corrupt = || Error::CacheCorruption {
      key: key.to_string(),
    };

    let bytes = self.store.get(&key.meta_key())?.ok_or_else(corrupt)?;
    serde_json::from_slice(&bytes).map_err(|_| corrupt())
  }

  /// Remove a single `(endpoint, params)` entry from both tiers.
  pub fn invalidate(&self, endpoint: &str, params: &Params) -> Result<()> {
    let key = derive_key(endpoint, params);
    debug!(endpoint, key = %key, "cache invalidate");
    self.purge(&key)
  }

  fn purge(&self, key: &CacheKey) -> Result<()> {
    self.memory()?.remove(key);
    self
      .store
      .remove_many(&[key.payload_key(), key.meta_key()])
  }

  /// Drop every record in both tiers.
  pub fn clear(&self) -> Result<()> {
    self.memory()?.clear();

    let mut keys = self.store.list_keys(PAYLOAD_PREFIX)?;
    keys.extend(self.store.list_keys(META_PREFIX)?);
    debug!(count = keys.len(), "cache clear");
    self.store.remove_many(&keys)
  }

  /// Purge expired, corrupt and orphaned records. Returns how many records
  /// were removed.
  pub fn cleanup_expired(&self) -> Result<usize> {
    let now = self.clock.now_ms();
    let mut purged = 0;

    for meta_key in self.store.list_keys(META_PREFIX)? {
      let Some(key) = CacheKey::from_meta_key(&meta_key) else {
        self.store.remove(&meta_key)?;
        purged += 1;
        continue;
      };

      let expired = match self.read_metadata(&key) {
        Ok(metadata) => metadata.is_expired(now),
        Err(Error::CacheCorruption { .. }) => true,
        Err(e) => return Err(e),
      };

      if expired {
        self.purge(&key)?;
        purged += 1;
      }
    }

    // Payloads whose metadata is gone can never be served
    for payload_key in self.store.list_keys(PAYLOAD_PREFIX)? {
      let orphan = match CacheKey::from_payload_key(&payload_key) {
        Some(key) => self.store.get(&key.meta_key())?.is_none(),
        None => true,
      };
      if orphan {
        self.store.remove(&payload_key)?;
        if let Some(key) = CacheKey::from_payload_key(&payload_key) {
          self.memory()?.remove(&key);
        }
        purged += 1;
      }
    }

    if purged > 0 {
      debug!(purged, "cache cleanup");
    }
    Ok(purged)
  }

  pub fn stats(&self) -> Result<CacheStats> {
    let now = self.clock.now_ms();
    let total_items = self.store.list_keys(PAYLOAD_PREFIX)?.len();
    let memory_items = self.memory()?.len();

    let mut total_age = 0f64;
    let mut counted = 0usize;
    for meta_key in self.store.list_keys(META_PREFIX)? {
      let Some(key) = CacheKey::from_meta_key(&meta_key) else {
        continue;
      };
      if let Ok(metadata) = self.read_metadata(&key) {
        total_age += metadata.age_ms(now) as f64;
        counted += 1;
      }
    }

    Ok(CacheStats {
      total_items,
      memory_items,
      average_age_ms: if counted > 0 {
        total_age / counted as f64
      } else {
        0.0
      },
    })
  }
}

impl Clone for TieredCache {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      memory: Arc::clone(&self.memory),
      clock: Arc::clone(&self.clock),
      default_max_age: self.default_max_age,
    }
  }
}
