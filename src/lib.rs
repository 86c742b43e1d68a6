//! Offline-first data access for clients on unreliable networks.
//!
//! Reads go through a two-tier TTL cache and degrade to stale data when the
//! network is gone. Writes that fail while offline are persisted to a durable
//! queue and replayed, in order and at least once, when connectivity returns.
//!
//! [`OfflineClient`] is the entry point; storage, transport, connectivity and
//! time are injected so the host decides how each is provided.

pub mod cache;
pub mod client;
pub mod clock;
pub mod connectivity;
pub mod error;
pub mod queue;
pub mod transport;

#[cfg(test)]
mod testing;

pub use cache::{CacheResult, CacheSource, CacheStats, Params};
pub use client::{CacheOptions, ClientOptions, OfflineClient, RetryPolicy, WriteOptions, WriteOutcome};
pub use error::{Error, Result};
pub use queue::{
  DrainReport, InvalidationTarget, QueueOutcome, QueuedOperation, SyncPhase, SyncStatus,
};
