//! Offline-aware client that wraps a transport with transparent caching and
//! a replay queue for writes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{
  CacheRecord, CacheResult, CacheStats, GetOptions, KeyValueStore, Params, TieredCache,
  DEFAULT_MAX_AGE,
};
use crate::clock::Clock;
use crate::connectivity::ConnectivityProbe;
use crate::error::{Error, Result};
use crate::queue::{
  DrainReport, DurableQueue, InvalidationTarget, NewOperation, OperationKind, QueuedOperation,
  SyncStatus, DEFAULT_MAX_ATTEMPTS,
};
use crate::transport::{Method, Transport, TransportError, TransportRequest, TransportResponse};

/// Bounded retry with a fixed delay, for transient transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total tries, including the first one.
  pub attempts: u32,
  pub delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 3,
      delay: Duration::from_millis(1000),
    }
  }
}

impl RetryPolicy {
  /// A single try.
  pub fn none() -> Self {
    Self {
      attempts: 1,
      delay: Duration::ZERO,
    }
  }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
  pub retry: RetryPolicy,
  /// TTL for reads that don't specify one.
  pub default_max_age: Duration,
  /// Replay attempts per queued operation.
  pub max_attempts: u32,
  /// Drain the queue from `on_reconnect`.
  pub auto_drain_on_reconnect: bool,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      retry: RetryPolicy::default(),
      default_max_age: DEFAULT_MAX_AGE,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      auto_drain_on_reconnect: false,
    }
  }
}

/// Per-read caching behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
  pub use_cache: bool,
  /// Skip the cache lookup and go to the network (a cached value can still
  /// serve as the offline fallback).
  pub force_refresh: bool,
  /// TTL for the record written on a network hit.
  pub max_age: Option<Duration>,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      use_cache: true,
      force_refresh: false,
      max_age: None,
    }
  }
}

impl CacheOptions {
  pub fn no_cache() -> Self {
    Self {
      use_cache: false,
      ..Self::default()
    }
  }

  pub fn refresh(self) -> Self {
    Self {
      force_refresh: true,
      ..self
    }
  }

  pub fn with_max_age(self, max_age: Duration) -> Self {
    Self {
      max_age: Some(max_age),
      ..self
    }
  }
}

/// Per-write behaviour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOptions {
  /// Queue the write instead of failing when offline.
  pub can_queue: bool,
  /// Cache entries to drop once the write has gone through.
  pub invalidate: Vec<InvalidationTarget>,
}

impl WriteOptions {
  pub fn queueable() -> Self {
    Self {
      can_queue: true,
      ..Self::default()
    }
  }

  pub fn invalidate(mut self, endpoint: impl Into<String>, params: Params) -> Self {
    self.invalidate.push(InvalidationTarget::new(endpoint, params));
    self
  }
}

/// What happened to a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// The server accepted it.
  Sent(TransportResponse),
  /// Offline: accepted locally, will be replayed by `process_queued_operations`.
  Queued(QueuedOperation),
}

impl WriteOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, WriteOutcome::Queued(_))
  }

  pub fn response(&self) -> Option<&TransportResponse> {
    match self {
      WriteOutcome::Sent(response) => Some(response),
      WriteOutcome::Queued(_) => None,
    }
  }
}

/// Client with transparent caching and offline write queuing.
///
/// Construct exactly one per storage namespace and share it by cloning; clones
/// share the cache, the queue and the drain guard.
#[derive(Clone)]
pub struct OfflineClient {
  transport: Arc<dyn Transport>,
  probe: Arc<dyn ConnectivityProbe>,
  clock: Arc<dyn Clock>,
  cache: TieredCache,
  queue: Arc<DurableQueue>,
  options: ClientOptions,
}

impl OfflineClient {
  /// Create a client over `store`, loading any persisted queue.
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    probe: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    options: ClientOptions,
  ) -> Result<Self> {
    let cache = TieredCache::new(Arc::clone(&store), Arc::clone(&clock))
      .with_default_max_age(options.default_max_age);
    let queue = DurableQueue::open(store, Arc::clone(&clock))?
      .with_default_max_attempts(options.max_attempts);

    Ok(Self {
      transport,
      probe,
      clock,
      cache,
      queue: Arc::new(queue),
      options,
    })
  }

  pub fn is_online(&self) -> bool {
    self.probe.is_online()
  }

  pub fn cache(&self) -> &TieredCache {
    &self.cache
  }

  /// Cache-first read.
  ///
  /// 1. Fresh cache hit (any cached value when offline) - return it, no network
  /// 2. Offline miss - `Error::Offline`
  /// 3. Otherwise fetch, retrying transient errors, and write through
  /// 4. If the fetch fails transiently, fall back to the cached value if any
  pub async fn get(
    &self,
    endpoint: &str,
    params: &Params,
    options: CacheOptions,
  ) -> Result<CacheResult<Vec<u8>>> {
    let online = self.probe.is_online();
    let cached = if options.use_cache {
      self.peek(endpoint, params)
    } else {
      None
    };

    if let (Some(record), false) = (&cached, options.force_refresh) {
      if !online {
        debug!(endpoint, "offline, serving cached data");
        return Ok(CacheResult::offline(
          record.payload.clone(),
          record.created_at_ms(),
        ));
      }
      if !record.metadata.is_expired(self.clock.now_ms()) {
        return Ok(CacheResult::from_cache(
          record.payload.clone(),
          record.created_at_ms(),
          false,
        ));
      }
    }

    if !online {
      return match cached {
        Some(record) => {
          debug!(endpoint, "offline refresh, serving cached data");
          Ok(CacheResult::offline(record.payload, record.metadata.timestamp))
        }
        None => Err(Error::Offline {
          endpoint: endpoint.to_string(),
        }),
      };
    }

    let request = TransportRequest::new(Method::Get, endpoint).with_params(params.clone());
    match self.perform_with_retry(request).await {
      Ok(response) => {
        if options.use_cache {
          let max_age = options.max_age.unwrap_or(self.cache.default_max_age());
          if let Err(e) = self.cache.set(endpoint, params, &response.body, max_age) {
            warn!(endpoint, error = %e, "failed to write response to cache");
          }
        }
        Ok(CacheResult::from_network(response.body))
      }
      Err(e) => {
        let online = self.probe.is_online();
        if e.is_transient() || !online {
          if let Some(record) = cached {
            warn!(endpoint, error = %e, "fetch failed, serving cached data");
            let created_at = record.metadata.timestamp;
            return Ok(if online {
              CacheResult::from_cache(record.payload, created_at, true)
            } else {
              CacheResult::offline(record.payload, created_at)
            });
          }
        }
        if !online {
          return Err(Error::Offline {
            endpoint: endpoint.to_string(),
          });
        }
        Err(e.into())
      }
    }
  }

  /// Cached record regardless of age. Read failures count as a miss.
  fn peek(&self, endpoint: &str, params: &Params) -> Option<CacheRecord> {
    match self.cache.get(endpoint, params, GetOptions::allow_stale()) {
      Ok(record) => record,
      Err(e) => {
        warn!(endpoint, error = %e, "cache read failed");
        None
      }
    }
  }

  /// `get`, decoding the payload as JSON.
  ///
  /// A cached payload that no longer decodes is purged and refetched.
  pub async fn get_json<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    params: &Params,
    options: CacheOptions,
  ) -> Result<CacheResult<T>> {
    let result = self.get(endpoint, params, options).await?;
    if result.is_from_network() {
      let data: T = serde_json::from_slice(&result.data)?;
      return Ok(result.map(|_| data));
    }

    match serde_json::from_slice::<T>(&result.data) {
      Ok(data) => Ok(result.map(|_| data)),
      Err(e) => {
        warn!(endpoint, error = %e, "cached payload does not decode, purging");
        self.cache.invalidate(endpoint, params)?;
        let fresh = self.get(endpoint, params, options.refresh()).await?;
        let data: T = serde_json::from_slice(&fresh.data)?;
        Ok(fresh.map(|_| data))
      }
    }
  }

  pub async fn post(
    &self,
    endpoint: &str,
    payload: impl Into<Vec<u8>>,
    options: WriteOptions,
  ) -> Result<WriteOutcome> {
    self
      .write(Method::Post, endpoint, Some(payload.into()), options)
      .await
  }

  pub async fn put(
    &self,
    endpoint: &str,
    payload: impl Into<Vec<u8>>,
    options: WriteOptions,
  ) -> Result<WriteOutcome> {
    self
      .write(Method::Put, endpoint, Some(payload.into()), options)
      .await
  }

  pub async fn delete(
    &self,
    endpoint: &str,
    payload: Option<Vec<u8>>,
    options: WriteOptions,
  ) -> Result<WriteOutcome> {
    self.write(Method::Delete, endpoint, payload, options).await
  }

  pub async fn post_json<T: Serialize + ?Sized>(
    &self,
    endpoint: &str,
    payload: &T,
    options: WriteOptions,
  ) -> Result<WriteOutcome> {
    self.post(endpoint, serde_json::to_vec(payload)?, options).await
  }

  pub async fn put_json<T: Serialize + ?Sized>(
    &self,
    endpoint: &str,
    payload: &T,
    options: WriteOptions,
  ) -> Result<WriteOutcome> {
    self.put(endpoint, serde_json::to_vec(payload)?, options).await
  }

  /// Network first. Offline failures are queued when `can_queue` is set.
  async fn write(
    &self,
    method: Method,
    endpoint: &str,
    payload: Option<Vec<u8>>,
    options: WriteOptions,
  ) -> Result<WriteOutcome> {
    let request = TransportRequest::new(method, endpoint).with_payload(payload.clone());

    let error = match self.perform_with_retry(request).await {
      Ok(response) => {
        self.apply_invalidation(&options.invalidate);
        return Ok(WriteOutcome::Sent(response));
      }
      Err(e) => e,
    };

    if self.probe.is_online() {
      return Err(error.into());
    }

    let kind = match OperationKind::from_method(method) {
      Some(kind) if options.can_queue => kind,
      _ => {
        return Err(Error::Offline {
          endpoint: endpoint.to_string(),
        })
      }
    };

    let op = self.queue.enqueue(
      NewOperation::new(kind, endpoint, payload).with_invalidation(options.invalidate),
    )?;
    info!(endpoint, id = %op.id, error = %error, "offline, write queued");
    Ok(WriteOutcome::Queued(op))
  }

  fn apply_invalidation(&self, targets: &[InvalidationTarget]) {
    for target in targets {
      if let Err(e) = self.cache.invalidate(&target.endpoint, &target.params) {
        warn!(endpoint = %target.endpoint, error = %e, "failed to invalidate cache");
      }
    }
  }

  /// Explicit bounded loop; stops early once connectivity is gone.
  async fn perform_with_retry(
    &self,
    request: TransportRequest,
  ) -> std::result::Result<TransportResponse, TransportError> {
    let attempts = self.options.retry.attempts.max(1);
    let mut attempt = 1;

    loop {
      let result = self
        .transport
        .perform(request.clone())
        .await
        .and_then(TransportResponse::error_for_status);

      match result {
        Ok(response) => return Ok(response),
        Err(e) if e.is_transient() && attempt < attempts && self.probe.is_online() => {
          debug!(
            method = %request.method,
            endpoint = %request.endpoint,
            attempt,
            error = %e,
            "transient failure, retrying"
          );
          attempt += 1;
          tokio::time::sleep(self.options.retry.delay).await;
        }
        Err(e) => return Err(e),
      }
    }
  }

  /// Replay one queued operation: a single dispatch, since each drain pass
  /// already charges one attempt. Never queues.
  async fn replay(&self, op: QueuedOperation) -> Result<()> {
    let request = TransportRequest::new(op.kind.method(), op.endpoint).with_payload(op.payload);
    self
      .transport
      .perform(request)
      .await
      .and_then(TransportResponse::error_for_status)?;
    Ok(())
  }

  /// Queue an operation without trying the network first.
  pub fn enqueue(&self, operation: NewOperation) -> Result<QueuedOperation> {
    self.queue.enqueue(operation)
  }

  /// Replay the queue once, in submission order. Requires connectivity.
  pub async fn process_queued_operations(&self) -> Result<DrainReport> {
    self
      .queue
      .drain(self.probe.as_ref(), &self.cache, |op| self.replay(op))
      .await
  }

  /// Call when the host's connectivity comes back. Drains the queue if
  /// `auto_drain_on_reconnect` is set; returns `None` otherwise.
  pub async fn on_reconnect(&self) -> Result<Option<DrainReport>> {
    if !self.options.auto_drain_on_reconnect || !self.probe.is_online() {
      return Ok(None);
    }
    self.process_queued_operations().await.map(Some)
  }

  pub fn queued_operations(&self) -> Result<Vec<QueuedOperation>> {
    self.queue.pending()
  }

  pub fn failed_operations(&self) -> Result<Vec<QueuedOperation>> {
    self.queue.failed()
  }

  pub fn requeue_failed(&self, id: &str) -> Result<QueuedOperation> {
    self.queue.requeue_failed(id)
  }

  pub fn discard_failed(&self, id: &str) -> Result<QueuedOperation> {
    self.queue.discard_failed(id)
  }

  pub fn clear_queue(&self) -> Result<usize> {
    self.queue.clear()
  }

  pub fn sync_status(&self) -> Result<SyncStatus> {
    self.queue.status()
  }

  /// Live sync status, for a pending-changes badge.
  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.queue.subscribe()
  }

  pub fn invalidate_cache(&self, endpoint: &str, params: &Params) -> Result<()> {
    self.cache.invalidate(endpoint, params)
  }

  pub fn clear_cache(&self) -> Result<()> {
    self.cache.clear()
  }

  pub fn cache_stats(&self) -> Result<CacheStats> {
    self.cache.stats()
  }

  pub fn cleanup_cache(&self) -> Result<usize> {
    self.cache.cleanup_expired()
  }
}
