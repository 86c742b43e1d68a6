//! Durable, replayable queue of mutating operations.
//!
//! Operations are persisted before `enqueue` returns and replayed strictly in
//! submission order by `drain`. Each replay charges one attempt; an operation
//! that exhausts its attempts is moved to a separate failed bucket, which is
//! never retried automatically.

mod operation;

pub use operation::{
  DispatchResult, DrainReason, DrainReport, InvalidationTarget, NewOperation, OperationKind,
  QueueOutcome, QueuedOperation, SyncPhase, SyncStatus,
};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{KeyValueStore, TieredCache};
use crate::clock::Clock;
use crate::connectivity::ConnectivityProbe;
use crate::error::{Error, Result};

/// Store key of the pending list.
pub const PENDING_KEY: &str = "sync_pending_operations";
/// Store key of the permanently failed list.
pub const FAILED_KEY: &str = "sync_failed_operations";
/// Store key of the last drain timestamp (Unix milliseconds).
pub const LAST_DRAIN_KEY: &str = "sync_last_drain";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default)]
struct QueueState {
  pending: Vec<QueuedOperation>,
  failed: Vec<QueuedOperation>,
}

pub struct DurableQueue {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  state: Mutex<QueueState>,
  draining: AtomicBool,
  default_max_attempts: u32,
  status: watch::Sender<SyncStatus>,
}

impl DurableQueue {
  /// Load the queue from `store`.
  ///
  /// An unreadable queue is an error rather than an empty queue, so that
  /// persisted operations are never discarded on start-up.
  pub fn open(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Result<Self> {
    let mut pending = load_list(store.as_ref(), PENDING_KEY)?;
    let failed = load_list(store.as_ref(), FAILED_KEY)?;

    // An interrupted move to the failed bucket leaves the operation in both lists
    pending.retain(|op| !failed.iter().any(|f| f.id == op.id));

    if !pending.is_empty() || !failed.is_empty() {
      info!(
        pending = pending.len(),
        failed = failed.len(),
        "loaded operation queue"
      );
    }

    let (status, _) = watch::channel(SyncStatus {
      pending: pending.len(),
      failed: failed.len(),
      last_drain_ms: read_last_drain(store.as_ref())?,
      draining: false,
      phase: SyncPhase::Idle,
    });

    Ok(Self {
      store,
      clock,
      state: Mutex::new(QueueState { pending, failed }),
      draining: AtomicBool::new(false),
      default_max_attempts: DEFAULT_MAX_ATTEMPTS,
      status,
    })
  }

  /// Attempts granted to operations that don't set their own bound.
  pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
    self.default_max_attempts = max_attempts.max(1);
    self
  }

  fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
    self
      .state
      .lock()
      .map_err(|e| Error::QueuePersistence(format!("Lock poisoned: {}", e)))
  }

  /// Apply `f` to a copy of the state, persist whatever changed, then commit.
  /// On a persistence failure the in-memory state is left untouched.
  fn update<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> Result<R> {
    let mut state = self.lock()?;
    let mut next = state.clone();
    let out = f(&mut next);

    let mut writes = Vec::with_capacity(2);
    if next.failed != state.failed {
      writes.push((FAILED_KEY.to_string(), encode_list(FAILED_KEY, &next.failed)?));
    }
    if next.pending != state.pending {
      writes.push((PENDING_KEY.to_string(), encode_list(PENDING_KEY, &next.pending)?));
    }
    // A moving operation is written to its new list before leaving the old one
    if next.pending.len() > state.pending.len() {
      writes.reverse();
    }
    if !writes.is_empty() {
      self
        .store
        .set_many(&writes)
        .map_err(|e| Error::QueuePersistence(format!("Failed to write queue: {}", e)))?;
    }

    let (pending, failed) = (next.pending.len(), next.failed.len());
    *state = next;
    self.status.send_if_modified(|status| {
      let changed = status.pending != pending || status.failed != failed;
      status.pending = pending;
      status.failed = failed;
      changed
    });
    Ok(out)
  }

  fn set_phase(&self, phase: SyncPhase) {
    let draining = self.draining.load(Ordering::SeqCst);
    self.status.send_if_modified(|status| {
      let changed = status.phase != phase || status.draining != draining;
      status.phase = phase;
      status.draining = draining;
      changed
    });
  }

  /// Receiver that sees every status change: counts after each persisted
  /// update, and phase transitions around each drain.
  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  /// Durably append an operation. Returns it with its id and timestamps set.
  pub fn enqueue(&self, new: NewOperation) -> Result<QueuedOperation> {
    let op = QueuedOperation {
      id: uuid::Uuid::new_v4().to_string(),
      kind: new.kind,
      endpoint: new.endpoint,
      payload: new.payload,
      invalidation_targets: new.invalidation_targets,
      max_attempts: new.max_attempts.unwrap_or(self.default_max_attempts).max(1),
      attempt_count: 0,
      enqueued_at_ms: self.clock.now_ms(),
      last_error: None,
    };

    let queued = op.clone();
    let pending = self.update(move |state| {
      state.pending.push(op);
      state.pending.len()
    })?;

    info!(
      id = %queued.id,
      kind = ?queued.kind,
      endpoint = %queued.endpoint,
      pending,
      "operation queued"
    );
    Ok(queued)
  }

  /// Snapshot of pending operations, in replay order.
  pub fn pending(&self) -> Result<Vec<QueuedOperation>> {
    Ok(self.lock()?.pending.clone())
  }

  /// Snapshot of operations that exhausted their attempts.
  pub fn failed(&self) -> Result<Vec<QueuedOperation>> {
    Ok(self.lock()?.failed.clone())
  }

  pub fn last_drain_ms(&self) -> Result<Option<i64>> {
    read_last_drain(self.store.as_ref())
  }

  pub fn status(&self) -> Result<SyncStatus> {
    Ok(*self.status.borrow())
  }

  /// Move a failed operation back to the end of the pending list with a
  /// fresh attempt budget.
  pub fn requeue_failed(&self, id: &str) -> Result<QueuedOperation> {
    let requeued = self.update(|state| {
      let index = state.failed.iter().position(|op| op.id == id)?;
      let mut op = state.failed.remove(index);
      op.attempt_count = 0;
      op.last_error = None;
      state.pending.push(op.clone());
      Some(op)
    })?;

    let op = requeued.ok_or_else(|| Error::UnknownOperation { id: id.to_string() })?;
    info!(id = %op.id, endpoint = %op.endpoint, "failed operation requeued");
    Ok(op)
  }

  /// Drop a failed operation for good.
  pub fn discard_failed(&self, id: &str) -> Result<QueuedOperation> {
    let discarded = self.update(|state| {
      let index = state.failed.iter().position(|op| op.id == id)?;
      Some(state.failed.remove(index))
    })?;

    let op = discarded.ok_or_else(|| Error::UnknownOperation { id: id.to_string() })?;
    info!(id = %op.id, endpoint = %op.endpoint, "failed operation discarded");
    Ok(op)
  }

  /// Drop every pending operation. Returns how many were dropped.
  pub fn clear(&self) -> Result<usize> {
    let dropped = self.update(|state| std::mem::take(&mut state.pending).len())?;
    if dropped > 0 {
      warn!(dropped, "pending operations cleared");
    }
    Ok(dropped)
  }

  /// Replay pending operations once each, in submission order.
  ///
  /// `dispatch` performs the underlying call and must not queue anything itself.
  /// A persistence failure aborts the pass with `Error::QueuePersistence`;
  /// operations already charged an attempt stay charged.
  pub async fn drain<F, Fut>(
    &self,
    probe: &dyn ConnectivityProbe,
    cache: &TieredCache,
    dispatch: F,
  ) -> Result<DrainReport>
  where
    F: FnMut(QueuedOperation) -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    if !probe.is_online() {
      let remaining = self.lock()?.pending.len();
      debug!(remaining, "drain skipped: offline");
      self.set_phase(SyncPhase::Offline);
      return Ok(DrainReport::skipped(DrainReason::Offline, remaining));
    }

    let Some(guard) = DrainGuard::acquire(&self.draining) else {
      let remaining = self.lock()?.pending.len();
      debug!(remaining, "drain skipped: already running");
      return Ok(DrainReport::skipped(DrainReason::AlreadyRunning, remaining));
    };
    self.set_phase(SyncPhase::Syncing);

    let outcome = self.drain_pass(probe, cache, dispatch).await;
    drop(guard);

    self.set_phase(match &outcome {
      Ok(report) if report.reason == DrainReason::WentOffline => SyncPhase::Offline,
      Ok(report) if report.remaining == 0 => SyncPhase::Success,
      _ => SyncPhase::Error,
    });
    outcome
  }

  async fn drain_pass<F, Fut>(
    &self,
    probe: &dyn ConnectivityProbe,
    cache: &TieredCache,
    mut dispatch: F,
  ) -> Result<DrainReport>
  where
    F: FnMut(QueuedOperation) -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    let ids: Vec<String> = self.lock()?.pending.iter().map(|op| op.id.clone()).collect();
    let mut reason = DrainReason::Completed;
    let mut results = Vec::with_capacity(ids.len());

    for id in ids {
      if !probe.is_online() {
        reason = DrainReason::WentOffline;
        break;
      }

      // Charge the attempt before dispatching, so a crash mid-call still counts
      let charged = self.update(|state| {
        let op = state.pending.iter_mut().find(|op| op.id == id)?;
        op.attempt_count += 1;
        Some(op.clone())
      })?;
      let Some(op) = charged else {
        continue;
      };

      debug!(
        id = %op.id,
        endpoint = %op.endpoint,
        attempt = op.attempt_count,
        max_attempts = op.max_attempts,
        "dispatching queued operation"
      );

      let result = match dispatch(op.clone()).await {
        Ok(()) => {
          self.update(|state| state.pending.retain(|p| p.id != op.id))?;
          for target in &op.invalidation_targets {
            if let Err(e) = cache.invalidate(&target.endpoint, &target.params) {
              warn!(endpoint = %target.endpoint, error = %e, "failed to invalidate after replay");
            }
          }
          info!(id = %op.id, endpoint = %op.endpoint, "queued operation succeeded");
          DispatchResult {
            id: op.id,
            outcome: QueueOutcome::Succeeded,
            error: None,
          }
        }
        Err(e) => {
          let message = e.to_string();
          let outcome = if op.is_exhausted() {
            self.update(|state| {
              if let Some(index) = state.pending.iter().position(|p| p.id == op.id) {
                let mut failed = state.pending.remove(index);
                failed.last_error = Some(message.clone());
                state.failed.push(failed);
              }
            })?;
            warn!(
              id = %op.id,
              endpoint = %op.endpoint,
              attempts = op.attempt_count,
              error = %message,
              "queued operation permanently failed"
            );
            QueueOutcome::PermanentlyFailed
          } else {
            self.update(|state| {
              if let Some(p) = state.pending.iter_mut().find(|p| p.id == op.id) {
                p.last_error = Some(message.clone());
              }
            })?;
            debug!(id = %op.id, error = %message, "queued operation will be retried");
            QueueOutcome::RetryLater
          };
          DispatchResult {
            id: op.id,
            outcome,
            error: Some(message),
          }
        }
      };
      results.push(result);
    }

    let now = self.clock.now_ms();
    self
      .store
      .set(LAST_DRAIN_KEY, now.to_string().as_bytes())
      .map_err(|e| Error::QueuePersistence(e.to_string()))?;
    // Published with the phase change that ends the drain
    self.status.send_if_modified(|status| {
      status.last_drain_ms = Some(now);
      false
    });

    let report = DrainReport {
      reason,
      results,
      remaining: self.lock()?.pending.len(),
    };
    info!(
      processed = report.processed(),
      succeeded = report.succeeded(),
      retry_later = report.retry_later(),
      permanently_failed = report.permanently_failed(),
      remaining = report.remaining,
      reason = ?report.reason,
      "drain finished"
    );
    Ok(report)
  }
}

/// Marks a drain in progress for as long as it lives.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

fn load_list(store: &dyn KeyValueStore, key: &str) -> Result<Vec<QueuedOperation>> {
  let bytes = store
    .get(key)
    .map_err(|e| Error::QueuePersistence(format!("Failed to read {}: {}", key, e)))?;

  match bytes {
    Some(bytes) => serde_json::from_slice(&bytes)
      .map_err(|e| Error::QueuePersistence(format!("Failed to decode {}: {}", key, e))),
    None => Ok(Vec::new()),
  }
}

fn read_last_drain(store: &dyn KeyValueStore) -> Result<Option<i64>> {
  let bytes = store
    .get(LAST_DRAIN_KEY)
    .map_err(|e| Error::QueuePersistence(e.to_string()))?;
  Ok(bytes.and_then(|b| std::str::from_utf8(&b).ok()?.trim().parse().ok()))
}

fn encode_list(key: &str, ops: &[QueuedOperation]) -> Result<Vec<u8>> {
  serde_json::to_vec(ops)
    .map_err(|e| Error::QueuePersistence(format!("Failed to encode {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{GetOptions, MemoryStore, Params};
  use crate::clock::ManualClock;
  use crate::connectivity::ConnectivityFlag;
  use crate::testing::FailingStore;
  use std::sync::Mutex as StdMutex;
  use std::time::Duration;

  struct Fixture {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    cache: TieredCache,
    queue: DurableQueue,
    probe: ConnectivityFlag,
  }

  fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = TieredCache::new(store.clone(), clock.clone());
    let queue = DurableQueue::open(store.clone(), clock.clone()).unwrap();
    Fixture {
      store,
      clock,
      cache,
      queue,
      probe: ConnectivityFlag::new(true),
    }
  }

  fn create(endpoint: &str) -> NewOperation {
    NewOperation::new(OperationKind::Create, endpoint, Some(b"{}".to_vec()))
  }

  #[test]
  fn test_enqueue_is_persisted_before_returning() {
    let f = fixture();
    let op = f.queue.enqueue(create("/clients")).unwrap();

    assert_eq!(op.attempt_count, 0);
    assert_eq!(op.max_attempts, DEFAULT_MAX_ATTEMPTS);
    assert_eq!(op.enqueued_at_ms, 1_000);

    let reopened = DurableQueue::open(f.store.clone(), f.clock.clone()).unwrap();
    assert_eq!(reopened.pending().unwrap(), vec![op]);
  }

  #[test]
  fn test_enqueue_assigns_unique_ids() {
    let f = fixture();
    let a = f.queue.enqueue(create("/clients")).unwrap();
    let b = f.queue.enqueue(create("/clients")).unwrap();
    assert_ne!(a.id, b.id);
  }

  #[test]
  fn test_enqueue_fails_loudly_when_store_fails() {
    let store = Arc::new(FailingStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let queue = DurableQueue::open(store.clone(), clock).unwrap();

    store.fail_writes(true);
    let err = queue.enqueue(create("/clients")).unwrap_err();
    assert!(matches!(err, Error::QueuePersistence(_)));
    assert!(queue.pending().unwrap().is_empty());
  }

  #[test]
  fn test_open_refuses_corrupt_queue() {
    let store = Arc::new(MemoryStore::new());
    store.set(PENDING_KEY, b"not json").unwrap();
    let result = DurableQueue::open(store, Arc::new(ManualClock::new(0)));
    assert!(matches!(result, Err(Error::QueuePersistence(_))));
  }

  #[tokio::test]
  async fn test_drain_offline_does_nothing() {
    let f = fixture();
    f.queue.enqueue(create("/clients")).unwrap();
    f.probe.set_online(false);

    let report = f
      .queue
      .drain(&f.probe, &f.cache, |_| async { Ok(()) })
      .await
      .unwrap();

    assert_eq!(report.reason, DrainReason::Offline);
    assert_eq!(report.processed(), 0);
    assert_eq!(report.remaining, 1);
    assert_eq!(f.queue.pending().unwrap()[0].attempt_count, 0);
    assert_eq!(f.queue.last_drain_ms().unwrap(), None);
  }

  #[tokio::test]
  async fn test_drain_replays_in_fifo_order() {
    let f = fixture();
    let a = f.queue.enqueue(create("/a")).unwrap();
    let b = f.queue.enqueue(create("/b")).unwrap();
    let c = f.queue.enqueue(create("/c")).unwrap();

    let seen = StdMutex::new(Vec::new());
    let report = f
      .queue
      .drain(&f.probe, &f.cache, |op| {
        seen.lock().unwrap().push(op.endpoint.clone());
        async { Ok(()) }
      })
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["/a", "/b", "/c"]);
    let ids: Vec<_> = report.results.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, vec![a.id, b.id, c.id]);
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(f.queue.last_drain_ms().unwrap(), Some(1_000));
  }

  #[tokio::test]
  async fn test_failed_operation_keeps_its_place() {
    let f = fixture();
    f.queue.enqueue(create("/flaky")).unwrap();
    f.queue.enqueue(create("/ok")).unwrap();
    f.queue.enqueue(create("/later")).unwrap();

    let report = f
      .queue
      .drain(&f.probe, &f.cache, |op| async move {
        if op.endpoint == "/flaky" {
          Err(Error::Storage("boom".into()))
        } else {
          Ok(())
        }
      })
      .await
      .unwrap();
    assert_eq!(report.retry_later(), 1);
    assert_eq!(report.succeeded(), 2);

    let pending: Vec<_> = f
      .queue
      .pending()
      .unwrap()
      .into_iter()
      .map(|op| op.endpoint)
      .collect();
    assert_eq!(pending, vec!["/flaky"]);
    let flaky = &f.queue.pending().unwrap()[0];
    assert_eq!(flaky.attempt_count, 1);
    assert_eq!(flaky.last_error.as_deref(), Some("storage error: boom"));
  }

  #[tokio::test]
  async fn test_bounded_retry_moves_to_failed_bucket() {
    let f = fixture();
    let op = f.queue.enqueue(create("/mouvements/retrait")).unwrap();
    let dispatches = StdMutex::new(0u32);

    let always_fail = |_op: QueuedOperation| {
      *dispatches.lock().unwrap() += 1;
      async { Err(Error::Storage("rejected".into())) }
    };

    for expected_attempt in 1..=2 {
      let report = f.queue.drain(&f.probe, &f.cache, always_fail).await.unwrap();
      assert_eq!(report.results[0].outcome, QueueOutcome::RetryLater);
      assert_eq!(f.queue.pending().unwrap()[0].attempt_count, expected_attempt);
    }

    let report = f.queue.drain(&f.probe, &f.cache, always_fail).await.unwrap();
    assert_eq!(report.results[0].outcome, QueueOutcome::PermanentlyFailed);
    assert!(f.queue.pending().unwrap().is_empty());

    let failed = f.queue.failed().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, op.id);
    assert_eq!(failed[0].attempt_count, 3);

    // A fourth drain dispatches nothing
    let report = f.queue.drain(&f.probe, &f.cache, always_fail).await.unwrap();
    assert_eq!(report.processed(), 0);
    assert_eq!(*dispatches.lock().unwrap(), 3);
    assert!(f.queue.failed().unwrap()[0].attempt_count <= 3);
  }

  #[tokio::test]
  async fn test_success_applies_invalidation_targets() {
    let f = fixture();
    let ttl = Duration::from_secs(600);
    let client_7 = Params::new().with("clientId", 7);
    f.cache.set("/comptes", &client_7, b"old", ttl).unwrap();
    f.cache.set("/clients", &Params::new(), b"keep", ttl).unwrap();

    f.queue
      .enqueue(
        create("/mouvements/epargne")
          .with_invalidation(vec![InvalidationTarget::new("/comptes", client_7.clone())]),
      )
      .unwrap();

    f.queue
      .drain(&f.probe, &f.cache, |_| async { Ok(()) })
      .await
      .unwrap();

    assert!(f
      .cache
      .get("/comptes", &client_7, GetOptions::allow_stale())
      .unwrap()
      .is_none());
    assert!(f
      .cache
      .get("/clients", &Params::new(), GetOptions::default())
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_going_offline_mid_drain_stops_without_charging() {
    let f = fixture();
    f.queue.enqueue(create("/a")).unwrap();
    f.queue.enqueue(create("/b")).unwrap();

    let report = f
      .queue
      .drain(&f.probe, &f.cache, |_| {
        // connectivity drops while the first call is in flight
        f.probe.set_online(false);
        async { Err(Error::Storage("network lost".into())) }
      })
      .await
      .unwrap();

    assert_eq!(report.reason, DrainReason::WentOffline);
    assert_eq!(report.processed(), 1);
    let pending = f.queue.pending().unwrap();
    assert_eq!(pending[0].attempt_count, 1);
    assert_eq!(pending[1].attempt_count, 0);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_rejected() {
    let f = fixture();
    f.queue.enqueue(create("/a")).unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let rx = StdMutex::new(Some(rx));

    let slow = f.queue.drain(&f.probe, &f.cache, |_| {
      let rx = rx.lock().unwrap().take();
      async move {
        if let Some(rx) = rx {
          let _ = rx.await;
        }
        Ok(())
      }
    });

    let second = async {
      tokio::task::yield_now().await;
      let report = f
        .queue
        .drain(&f.probe, &f.cache, |_| async { Ok(()) })
        .await
        .unwrap();
      let _ = tx.send(());
      report
    };

    let (first, second) = tokio::join!(slow, second);
    assert_eq!(second.reason, DrainReason::AlreadyRunning);
    assert_eq!(first.unwrap().succeeded(), 1);
    assert!(!f.queue.status().unwrap().draining);
  }

  #[test]
  fn test_requeue_and_discard_failed() {
    let f = fixture();
    let mut failed_a = f.queue.enqueue(create("/a")).unwrap();
    let mut failed_b = f.queue.enqueue(create("/b")).unwrap();

    // Simulate two exhausted operations
    f.queue
      .update(|state| {
        failed_a.attempt_count = 3;
        failed_b.attempt_count = 3;
        state.pending.clear();
        state.failed = vec![failed_a.clone(), failed_b.clone()];
      })
      .unwrap();

    let requeued = f.queue.requeue_failed(&failed_a.id).unwrap();
    assert_eq!(requeued.attempt_count, 0);
    assert_eq!(f.queue.pending().unwrap(), vec![requeued]);

    f.queue.discard_failed(&failed_b.id).unwrap();
    assert!(f.queue.failed().unwrap().is_empty());

    assert!(matches!(
      f.queue.discard_failed("nope"),
      Err(Error::UnknownOperation { .. })
    ));

    let status = f.queue.status().unwrap();
    assert_eq!(status.pending, 1);
    assert_eq!(status.failed, 0);
    assert!(!status.is_synced());
  }

  #[test]
  fn test_requeue_keeps_operation_when_pending_write_fails() {
    let store = Arc::new(FailingStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let queue = DurableQueue::open(store.clone(), clock.clone()).unwrap();
    let mut op = queue.enqueue(create("/mouvements/epargne")).unwrap();
    queue
      .update(|state| {
        op.attempt_count = 3;
        state.pending.clear();
        state.failed = vec![op.clone()];
      })
      .unwrap();

    store.fail_key(Some(PENDING_KEY));
    let err = queue.requeue_failed(&op.id).unwrap_err();
    assert!(matches!(err, Error::QueuePersistence(_)));
    assert_eq!(queue.failed().unwrap(), vec![op.clone()]);

    let reopened = DurableQueue::open(store.clone(), clock).unwrap();
    assert!(reopened.pending().unwrap().is_empty());
    assert_eq!(reopened.failed().unwrap(), vec![op]);
  }

  #[test]
  fn test_exhaustion_keeps_operation_when_pending_write_fails() {
    let store = Arc::new(FailingStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let queue = DurableQueue::open(store.clone(), clock.clone()).unwrap();
    let op = queue.enqueue(create("/a")).unwrap();

    store.fail_key(Some(PENDING_KEY));
    let moved = queue.update(|state| {
      let mut exhausted = state.pending.remove(0);
      exhausted.attempt_count = 3;
      state.failed.push(exhausted);
    });
    assert!(moved.is_err());

    // failed bucket written, pending list not; open keeps the failed copy
    let reopened = DurableQueue::open(store.clone(), clock).unwrap();
    assert!(reopened.pending().unwrap().is_empty());
    let failed = reopened.failed().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, op.id);
  }

  #[tokio::test]
  async fn test_status_is_published_through_a_drain_cycle() {
    let f = fixture();
    let mut rx = f.queue.subscribe();
    assert_eq!(rx.borrow_and_update().phase, SyncPhase::Idle);

    f.queue.enqueue(create("/mouvements/epargne")).unwrap();
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().pending, 1);

    f.probe.set_online(false);
    f.queue
      .drain(&f.probe, &f.cache, |_| async { Ok(()) })
      .await
      .unwrap();
    assert_eq!(rx.borrow_and_update().phase, SyncPhase::Offline);

    f.probe.set_online(true);
    let watcher = f.queue.subscribe();
    let seen = StdMutex::new(Vec::new());
    f.queue
      .drain(&f.probe, &f.cache, |_| {
        seen.lock().unwrap().push(*watcher.borrow());
        async { Ok(()) }
      })
      .await
      .unwrap();

    let during = seen.into_inner().unwrap();
    assert_eq!(during.len(), 1);
    assert_eq!(during[0].phase, SyncPhase::Syncing);
    assert!(during[0].draining);

    let after = *rx.borrow_and_update();
    assert_eq!(after.phase, SyncPhase::Success);
    assert!(!after.draining);
    assert_eq!(after.pending, 0);
    assert_eq!(after.last_drain_ms, Some(1_000));
  }

  #[tokio::test]
  async fn test_status_reports_error_when_work_remains() {
    let f = fixture();
    f.queue.enqueue(create("/a")).unwrap();
    let mut rx = f.queue.subscribe();

    f.queue
      .drain(&f.probe, &f.cache, |_| async {
        Err(Error::Transport(crate::transport::TransportError::status(
          503, "busy",
        )))
      })
      .await
      .unwrap();
    let status = *rx.borrow_and_update();
    assert_eq!(status.phase, SyncPhase::Error);
    assert_eq!(status.pending, 1);

    // counts change without touching the phase
    f.queue.clear().unwrap();
    assert!(rx.has_changed().unwrap());
    let status = *rx.borrow_and_update();
    assert_eq!(status.pending, 0);
    assert_eq!(status.phase, SyncPhase::Error);
    assert_eq!(f.queue.status().unwrap(), status);
  }

  #[test]
  fn test_interrupted_failure_move_is_repaired_on_open() {
    let f = fixture();
    let op = f.queue.enqueue(create("/a")).unwrap();
    // failed bucket written, pending list not yet rewritten
    f.store
      .set(FAILED_KEY, &encode_list(FAILED_KEY, &[op.clone()]).unwrap())
      .unwrap();

    let reopened = DurableQueue::open(f.store.clone(), f.clock.clone()).unwrap();
    assert!(reopened.pending().unwrap().is_empty());
    assert_eq!(reopened.failed().unwrap(), vec![op]);
  }

  #[test]
  fn test_clear_drops_pending() {
    let f = fixture();
    f.queue.enqueue(create("/a")).unwrap();
    f.queue.enqueue(create("/b")).unwrap();
    assert_eq!(f.queue.clear().unwrap(), 2);
    assert!(f.queue.status().unwrap().is_synced());

    let reopened = DurableQueue::open(f.store.clone(), f.clock.clone()).unwrap();
    assert!(reopened.pending().unwrap().is_empty());
  }
}
