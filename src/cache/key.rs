//! Cache key derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Storage prefix for cached payloads.
pub const PAYLOAD_PREFIX: &str = "cache_";
/// Storage prefix for the metadata sidecar of a cached payload.
pub const META_PREFIX: &str = "meta_";

/// Request parameters. Kept sorted by name, so insertion order never
/// influences the derived key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert.
  pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.insert(name, value);
    self
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(name.into(), value.into());
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }

  /// Canonical JSON form of the parameters (names sorted).
  pub fn fingerprint(&self) -> String {
    let object: serde_json::Map<String, Value> =
      self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    Value::Object(object).to_string()
  }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

/// Stable identifier of a cached `(endpoint, params)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  /// The hex digest.
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Store key holding the payload bytes.
  pub fn payload_key(&self) -> String {
    format!("{}{}", PAYLOAD_PREFIX, self.0)
  }

  /// Store key holding the metadata sidecar.
  pub fn meta_key(&self) -> String {
    format!("{}{}", META_PREFIX, self.0)
  }

  /// Recover a key from a `meta_<hash>` store key.
  pub fn from_meta_key(store_key: &str) -> Option<Self> {
    store_key
      .strip_prefix(META_PREFIX)
      .filter(|hash| !hash.is_empty())
      .map(|hash| Self(hash.to_string()))
  }

  /// Recover a key from a `cache_<hash>` store key.
  pub fn from_payload_key(store_key: &str) -> Option<Self> {
    store_key
      .strip_prefix(PAYLOAD_PREFIX)
      .filter(|hash| !hash.is_empty())
      .map(|hash| Self(hash.to_string()))
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Derive the cache key for an endpoint and its parameters.
pub fn derive_key(endpoint: &str, params: &Params) -> CacheKey {
  let input = format!("{}:{}", normalize_endpoint(endpoint), params.fingerprint());

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  CacheKey(hex::encode(hasher.finalize()))
}

/// Trims surrounding whitespace. Paths are case-sensitive, so nothing else.
fn normalize_endpoint(endpoint: &str) -> &str {
  endpoint.trim()
}
