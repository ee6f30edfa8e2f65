use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

pub const DEFAULT_POLL_INITIAL: Duration = Duration::from_millis(10);
pub const DEFAULT_POLL_MAX: Duration = Duration::from_millis(100);

/// Bounds for the sleep-poll used while waiting on leader election or resharding.
///
/// Waiters also wake early whenever the watch dispatcher sees a change on
/// the leader or sharding nodes, so the sleep is an upper bound only.
#[derive(Debug, Clone)]
pub struct PollSettings {
  initial: Duration,
  max: Duration,
  wake: Arc<Notify>,
}

impl PollSettings {
  pub fn new(initial: Duration, max: Duration) -> Self {
    let initial = initial.max(Duration::from_millis(1));
    Self {
      initial,
      max: max.max(initial),
      wake: Arc::new(Notify::new()),
    }
  }

  pub fn backoff(&self) -> Backoff {
    Backoff {
      next: self.initial,
      max: self.max,
      wake: self.wake.clone(),
    }
  }

  /// Wakes every waiter currently sleeping in a [`Backoff`].
  pub(crate) fn wake_all(&self) {
    self.wake.notify_waiters();
  }
}

impl Default for PollSettings {
  fn default() -> Self {
    Self::new(DEFAULT_POLL_INITIAL, DEFAULT_POLL_MAX)
  }
}

#[derive(Debug)]
pub struct Backoff {
  next: Duration,
  max: Duration,
  wake: Arc<Notify>,
}

impl Backoff {
  /// Sleeps for the current interval (or until woken), then doubles it up to the bound.
  pub async fn wait(&mut self) {
    tokio::select! {
      _ = tokio::time::sleep(self.next) => {}
      _ = self.wake.notified() => {}
    }
    self.next = (self.next * 2).min(self.max);
  }
}
