//! Online/offline signal consulted by the client and the queue.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait ConnectivityProbe: Send + Sync {
  fn is_online(&self) -> bool;
}

/// Probe for hosts that always have a network (tests, server-side use).
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
  fn is_online(&self) -> bool {
    true
  }
}

/// Shared flag the host updates from its own network listener.
#[derive(Debug)]
pub struct ConnectivityFlag {
  online: AtomicBool,
}

impl ConnectivityFlag {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  /// Update the state. Returns true if this call brought the flag back online.
  pub fn set_online(&self, online: bool) -> bool {
    let was_online = self.online.swap(online, Ordering::SeqCst);
    online && !was_online
  }
}

impl Default for ConnectivityFlag {
  fn default() -> Self {
    Self::new(true)
  }
}

impl ConnectivityProbe for ConnectivityFlag {
  fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_flag_reports_reconnect_once() {
    let flag = ConnectivityFlag::new(false);
    assert!(!flag.is_online());

    assert!(flag.set_online(true));
    assert!(flag.is_online());
    assert!(!flag.set_online(true));

    assert!(!flag.set_online(false));
    assert!(!flag.is_online());
  }
}
