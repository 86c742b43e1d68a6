//! Test doubles shared by the unit tests.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{KeyValueStore, MemoryStore};
use crate::connectivity::ConnectivityFlag;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportError, TransportRequest, TransportResponse};

/// Memory store whose writes can be switched to fail, either all of them or
/// only those to one key.
///
/// `new()` applies `set_many` entry by entry, like a store without
/// transactions; `atomic()` applies a batch all or nothing.
#[derive(Default)]
pub struct FailingStore {
  inner: MemoryStore,
  fail_writes: AtomicBool,
  fail_key: Mutex<Option<String>>,
  atomic: bool,
}

impl FailingStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn atomic() -> Self {
    Self {
      atomic: true,
      ..Self::default()
    }
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn fail_key(&self, key: Option<&str>) {
    *self.fail_key.lock().unwrap() = key.map(str::to_string);
  }

  fn check(&self, key: &str) -> Result<()> {
    let key_fails = self.fail_key.lock().unwrap().as_deref() == Some(key);
    if self.fail_writes.load(Ordering::SeqCst) || key_fails {
      Err(Error::Storage("disk full".into()))
    } else {
      Ok(())
    }
  }
}

impl KeyValueStore for FailingStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self.inner.get(key)
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    self.check(key)?;
    self.inner.set(key, value)
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.check(key)?;
    self.inner.remove(key)
  }

  fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
    self.inner.list_keys(prefix)
  }

  fn set_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
    if self.atomic {
      for (key, _) in entries {
        self.check(key)?;
      }
      return self.inner.set_many(entries);
    }
    for (key, value) in entries {
      self.set(key, value)?;
    }
    Ok(())
  }
}

type Reply = std::result::Result<TransportResponse, TransportError>;

/// Transport that replays scripted replies and records every request.
///
/// Once the script runs out it keeps answering with the fallback reply.
pub struct ScriptedTransport {
  script: Mutex<VecDeque<Reply>>,
  fallback: Mutex<Reply>,
  requests: Mutex<Vec<TransportRequest>>,
  /// Flipped offline on every call, to simulate losing the network mid-request.
  drop_connectivity: Mutex<Option<Arc<ConnectivityFlag>>>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      fallback: Mutex::new(Ok(TransportResponse::ok("{}"))),
      requests: Mutex::new(Vec::new()),
      drop_connectivity: Mutex::new(None),
    }
  }

  pub fn push(&self, reply: Reply) -> &Self {
    self.script.lock().unwrap().push_back(reply);
    self
  }

  pub fn push_ok(&self, body: &str) -> &Self {
    self.push(Ok(TransportResponse::ok(body)))
  }

  pub fn set_fallback(&self, reply: Reply) {
    *self.fallback.lock().unwrap() = reply;
  }

  pub fn always_fail(&self, error: TransportError) {
    self.script.lock().unwrap().clear();
    self.set_fallback(Err(error));
  }

  pub fn drop_connectivity_on_call(&self, flag: Arc<ConnectivityFlag>) {
    *self.drop_connectivity.lock().unwrap() = Some(flag);
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<TransportRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl Transport for ScriptedTransport {
  fn perform(&self, request: TransportRequest) -> BoxFuture<'_, Reply> {
    self.requests.lock().unwrap().push(request);
    if let Some(flag) = self.drop_connectivity.lock().unwrap().as_ref() {
      flag.set_online(false);
    }
    let reply = self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| self.fallback.lock().unwrap().clone());
    async move { reply }.boxed()
  }
}
