//! Generic caching layer for data persistence and offline support.
//!
//! This module provides a payload-agnostic caching mechanism that:
//! - Derives stable keys from an endpoint and an unordered parameter set
//! - Keeps a memory tier in front of a persistent key/value store
//! - Expires records by TTL only, either lazily on read or through a sweep
//! - Can serve stale records when the network is unavailable

mod key;
mod layer;
mod storage;
mod types;

pub use key::{derive_key, CacheKey, Params, META_PREFIX, PAYLOAD_PREFIX};
pub use layer::{TieredCache, DEFAULT_MAX_AGE};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use types::{CacheMetadata, CacheRecord, CacheResult, CacheSource, CacheStats, GetOptions};
