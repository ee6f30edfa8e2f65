use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Per-job metrics (internal state) ---

/// Counters for one job on this host.
///
/// Cloning only clones the `Arc`s, so the orchestrator, the failover queue
/// and the watch handlers all update the same values.
#[derive(Debug, Clone)]
pub struct JobMetrics {
  /// Cycles started (trigger fired or run requested).
  pub cycles_triggered: Arc<AtomicUsize>,
  /// Cycles that found no executable item for this instance.
  pub cycles_skipped_empty: Arc<AtomicUsize>,
  /// Cycles aborted before execution (time drift, store failure).
  pub cycles_aborted: Arc<AtomicUsize>,
  /// Triggers skipped because an item was still running.
  pub misfires_recorded: Arc<AtomicUsize>,
  /// Catch-up executions run for misfired items.
  pub misfire_catch_ups: Arc<AtomicUsize>,
  pub items_succeeded: Arc<AtomicUsize>,
  pub items_failed: Arc<AtomicUsize>,
  pub items_panicked: Arc<AtomicUsize>,
  pub listener_errors: Arc<AtomicUsize>,
  /// Assignment epochs published by this instance as leader.
  pub reshards_published: Arc<AtomicUsize>,
  pub failover_enqueued: Arc<AtomicUsize>,
  /// Failover entries dropped because the queue was at capacity.
  pub failover_dropped: Arc<AtomicUsize>,
  pub failover_claimed: Arc<AtomicUsize>,
  pub item_execution_duration: Arc<SimpleHistogram>,
}

impl JobMetrics {
  pub fn new() -> Self {
    Self {
      cycles_triggered: Default::default(),
      cycles_skipped_empty: Default::default(),
      cycles_aborted: Default::default(),
      misfires_recorded: Default::default(),
      misfire_catch_ups: Default::default(),
      items_succeeded: Default::default(),
      items_failed: Default::default(),
      items_panicked: Default::default(),
      listener_errors: Default::default(),
      reshards_published: Default::default(),
      failover_enqueued: Default::default(),
      failover_dropped: Default::default(),
      failover_claimed: Default::default(),
      item_execution_duration: Arc::new(SimpleHistogram::default()),
    }
  }

  /// Creates a point-in-time copy of every counter.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;
    MetricsSnapshot {
      cycles_triggered: self.cycles_triggered.load(order),
      cycles_skipped_empty: self.cycles_skipped_empty.load(order),
      cycles_aborted: self.cycles_aborted.load(order),
      misfires_recorded: self.misfires_recorded.load(order),
      misfire_catch_ups: self.misfire_catch_ups.load(order),
      items_succeeded: self.items_succeeded.load(order),
      items_failed: self.items_failed.load(order),
      items_panicked: self.items_panicked.load(order),
      listener_errors: self.listener_errors.load(order),
      reshards_published: self.reshards_published.load(order),
      failover_enqueued: self.failover_enqueued.load(order),
      failover_dropped: self.failover_dropped.load(order),
      failover_claimed: self.failover_claimed.load(order),
      item_execution_duration_count: self.item_execution_duration.get_count(),
      item_execution_duration_sum_micros: self.item_execution_duration.get_sum_micros(),
    }
  }
}

impl Default for JobMetrics {
  fn default() -> Self {
    Self::new()
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of one job's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
  pub cycles_triggered: usize,
  pub cycles_skipped_empty: usize,
  pub cycles_aborted: usize,
  pub misfires_recorded: usize,
  pub misfire_catch_ups: usize,
  pub items_succeeded: usize,
  pub items_failed: usize,
  pub items_panicked: usize,
  pub listener_errors: usize,
  pub reshards_published: usize,
  pub failover_enqueued: usize,
  pub failover_dropped: usize,
  pub failover_claimed: usize,
  pub item_execution_duration_count: usize,
  pub item_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean item execution duration, if any item completed.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    if self.item_execution_duration_count == 0 {
      None
    } else {
      let mean = self.item_execution_duration_sum_micros / self.item_execution_duration_count;
      Some(Duration::from_micros(mean as u64))
    }
  }
}
