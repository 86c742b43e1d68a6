//! Queued operations and drain results.

use serde::{Deserialize, Serialize};

use crate::cache::Params;
use crate::transport::Method;

/// What a queued mutation does. Maps onto the HTTP verb used to replay it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl OperationKind {
  pub fn method(&self) -> Method {
    match self {
      OperationKind::Create => Method::Post,
      OperationKind::Update => Method::Put,
      OperationKind::Delete => Method::Delete,
    }
  }

  /// `None` for `GET`, which is never queued.
  pub fn from_method(method: Method) -> Option<Self> {
    match method {
      Method::Post => Some(OperationKind::Create),
      Method::Put => Some(OperationKind::Update),
      Method::Delete => Some(OperationKind::Delete),
      Method::Get => None,
    }
  }
}

/// A cache entry to drop once an operation has gone through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationTarget {
  pub endpoint: String,
  #[serde(default)]
  pub params: Params,
}

impl InvalidationTarget {
  pub fn new(endpoint: impl Into<String>, params: Params) -> Self {
    Self {
      endpoint: endpoint.into(),
      params,
    }
  }

  /// Target with no parameters.
  pub fn endpoint(endpoint: impl Into<String>) -> Self {
    Self::new(endpoint, Params::new())
  }
}

/// An operation as submitted, before the queue assigns its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
  pub kind: OperationKind,
  pub endpoint: String,
  pub payload: Option<Vec<u8>>,
  pub invalidation_targets: Vec<InvalidationTarget>,
  /// Falls back to the queue's default when unset.
  pub max_attempts: Option<u32>,
}

impl NewOperation {
  pub fn new(kind: OperationKind, endpoint: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
    Self {
      kind,
      endpoint: endpoint.into(),
      payload,
      invalidation_targets: Vec::new(),
      max_attempts: None,
    }
  }

  pub fn with_invalidation(mut self, targets: Vec<InvalidationTarget>) -> Self {
    self.invalidation_targets = targets;
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }
}

/// A pending (or permanently failed) mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
  pub id: String,
  pub kind: OperationKind,
  pub endpoint: String,
  #[serde(default, with = "hex_payload")]
  pub payload: Option<Vec<u8>>,
  #[serde(default)]
  pub invalidation_targets: Vec<InvalidationTarget>,
  pub max_attempts: u32,
  pub attempt_count: u32,
  pub enqueued_at_ms: i64,
  /// Message of the most recent failed dispatch.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl QueuedOperation {
  pub fn attempts_left(&self) -> u32 {
    self.max_attempts.saturating_sub(self.attempt_count)
  }

  pub fn is_exhausted(&self) -> bool {
    self.attempt_count >= self.max_attempts
  }
}

/// Classification of a single dispatch during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
  Succeeded,
  RetryLater,
  PermanentlyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
  pub id: String,
  pub outcome: QueueOutcome,
  pub error: Option<String>,
}

/// Why a drain stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
  /// Every pending operation was dispatched once.
  Completed,
  /// Offline when the drain was requested; nothing dispatched.
  Offline,
  /// Connectivity dropped mid-pass; the rest were left untouched.
  WentOffline,
  /// Another drain was in progress.
  AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
  pub reason: DrainReason,
  /// In dispatch order.
  pub results: Vec<DispatchResult>,
  /// Pending operations left after the pass.
  pub remaining: usize,
}

impl DrainReport {
  pub(crate) fn skipped(reason: DrainReason, remaining: usize) -> Self {
    Self {
      reason,
      results: Vec::new(),
      remaining,
    }
  }

  pub fn processed(&self) -> usize {
    self.results.len()
  }

  fn count(&self, outcome: QueueOutcome) -> usize {
    self.results.iter().filter(|r| r.outcome == outcome).count()
  }

  pub fn succeeded(&self) -> usize {
    self.count(QueueOutcome::Succeeded)
  }

  pub fn retry_later(&self) -> usize {
    self.count(QueueOutcome::RetryLater)
  }

  pub fn permanently_failed(&self) -> usize {
    self.count(QueueOutcome::PermanentlyFailed)
  }
}

/// Where the queue is in its sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
  /// No drain has run since the queue was opened.
  #[default]
  Idle,
  Syncing,
  /// Last drain left nothing pending.
  Success,
  /// Last drain left operations pending, or could not persist its progress.
  Error,
  /// Last drain was skipped or cut short for lack of connectivity.
  Offline,
}

/// Summary for a "N changes pending sync" indicator. Published on every
/// change through `DurableQueue::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
  pub pending: usize,
  pub failed: usize,
  pub last_drain_ms: Option<i64>,
  pub draining: bool,
  pub phase: SyncPhase,
}

impl SyncStatus {
  pub fn is_synced(&self) -> bool {
    self.pending == 0
  }
}

/// Payload bytes persisted as a hex string.
mod hex_payload {
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(payload: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match payload {
      Some(bytes) => s.serialize_some(&hex::encode(bytes)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    Option::<String>::deserialize(d)?
      .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
      .transpose()
  }
}
