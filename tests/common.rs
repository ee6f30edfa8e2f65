//! tests/common.rs
//! Shared helper functions for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use parking_lot::Mutex;
use shardkeeper::{
  item_fn, BoxedItemFn, InstanceId, JobConfiguration, JobHandle, JobHost, MemoryCluster, MemoryStore,
};
use tracing_subscriber::fmt::TestWriter;

pub const JOB: &str = "settlement";

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

/// A host bound to its own session, so tests can expire it.
pub struct TestHost {
  pub host: JobHost,
  pub store: MemoryStore,
}

// Builds a host named `name` with a deterministic instance id.
pub fn build_host(cluster: &MemoryCluster, name: &str, max_workers: usize) -> TestHost {
  let store = cluster.connect();
  let host = JobHost::builder()
    .store(Arc::new(store.clone()))
    .instance_id(InstanceId::new(name, "0"))
    .max_workers(max_workers)
    .poll_interval(StdDuration::from_millis(5), StdDuration::from_millis(20))
    .build()
    .expect("Failed to build host");
  TestHost { host, store }
}

pub fn job_config(total: u32) -> shardkeeper::JobConfigurationBuilder {
  JobConfiguration::builder(JOB, "0/5 * * * * ?", total).job_type("SettlementJob")
}

/// Executions per item, shared by every host of a test.
#[derive(Clone, Default)]
pub struct ItemLog {
  runs: Arc<Mutex<BTreeMap<u32, Vec<String>>>>,
}

impl ItemLog {
  pub fn record(&self, item: u32, host: &str) {
    self.runs.lock().entry(item).or_default().push(host.to_string());
  }

  pub fn count(&self, item: u32) -> usize {
    self.runs.lock().get(&item).map_or(0, Vec::len)
  }

  pub fn runs_on(&self, host: &str) -> Vec<u32> {
    let mut items = Vec::new();
    for (item, hosts) in self.runs.lock().iter() {
      for _ in hosts.iter().filter(|h| h.as_str() == host) {
        items.push(*item);
      }
    }
    items
  }

  pub fn total(&self) -> usize {
    self.runs.lock().values().map(Vec::len).sum()
  }

  pub fn clear(&self) {
    self.runs.lock().clear();
  }
}

// Records every execution in `log` under `host`, optionally sleeping first.
pub fn item_exec_logged(log: ItemLog, host: &str, delay: StdDuration) -> BoxedItemFn {
  let host = host.to_string();
  item_fn! {
    { let log = log.clone(); let host = host.clone(); }
    |ctx| {
      tracing::debug!(item = ctx.item, host = %host, "Logged item executing");
      log.record(ctx.item, &host);
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      Ok(())
    }
  }
}

// Like `item_exec_logged`, but sleeps for `delay` after recording while `stall` is set.
pub fn item_exec_stallable(log: ItemLog, host: &str, stall: Arc<AtomicBool>, delay: StdDuration) -> BoxedItemFn {
  let host = host.to_string();
  item_fn! {
    { let log = log.clone(); let host = host.clone(); let stall = stall.clone(); }
    |ctx| {
      log.record(ctx.item, &host);
      if stall.load(Ordering::SeqCst) {
        tokio::time::sleep(delay).await;
      }
      Ok(())
    }
  }
}

// Records the execution, then stays busy until `hold` is cleared.
pub fn item_exec_held(log: ItemLog, host: &str, hold: Arc<AtomicBool>) -> BoxedItemFn {
  let host = host.to_string();
  item_fn! {
    { let log = log.clone(); let host = host.clone(); let hold = hold.clone(); }
    |ctx| {
      log.record(ctx.item, &host);
      while hold.load(Ordering::SeqCst) {
        tokio::time::sleep(StdDuration::from_millis(10)).await;
      }
      Ok(())
    }
  }
}

// Increments `counter`; fails items in `failing`.
pub fn item_exec_counter_result(counter: Arc<AtomicUsize>, failing: Vec<u32>) -> BoxedItemFn {
  item_fn! {
    { let counter = counter.clone(); let failing = failing.clone(); }
    |ctx| {
      counter.fetch_add(1, Ordering::SeqCst);
      if failing.contains(&ctx.item) {
        return Err(format!("item {} refused", ctx.item));
      }
      Ok(())
    }
  }
}

// Creates an item function that panics for `item` and succeeds otherwise.
pub fn item_exec_panic_on(item: u32, counter: Arc<AtomicUsize>) -> BoxedItemFn {
  item_fn! {
    { let counter = counter.clone(); }
    |ctx| {
      tokio::task::yield_now().await;
      if ctx.item == item {
        panic!("Item forced panic!");
      }
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }
}

pub async fn setup_job(host: &JobHost, config: JobConfiguration, item_fn: BoxedItemFn) -> JobHandle {
  host
    .setup(config, item_fn, Vec::new())
    .await
    .expect("Job setup failed")
}

/// Polls `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: StdDuration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if check().await {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(20)).await;
  }
}

/// Runs cycles on every handle until the published assignment matches
/// `expected` (item → host name) and no resharding is pending.
///
/// Cycles run concurrently and are cut off after a short while: a follower's
/// cycle blocks until the leader has published.
pub async fn settle(
  cluster: &MemoryCluster,
  handles: &[&JobHandle],
  expected: &BTreeMap<u32, &str>,
) -> bool {
  wait_until(StdDuration::from_secs(5), move || async move {
    let cycles = handles
      .iter()
      .map(|handle| tokio::time::timeout(StdDuration::from_millis(500), handle.run_one_cycle()));
    let _ = futures::future::join_all(cycles).await;
    let Ok(assignment) = handles[0].assignment().await else {
      return false;
    };
    let published: BTreeMap<u32, &str> = assignment.iter().map(|(item, owner)| (*item, owner.host())).collect();
    let flagged = cluster.get(&format!("/{}/sharding/necessary", JOB)).is_some();
    &published == expected && !flagged
  })
  .await
}

/// `[(first..=last, host), ...]` as an item → host map.
pub fn expected_assignment(ranges: &[(std::ops::RangeInclusive<u32>, &'static str)]) -> BTreeMap<u32, &'static str> {
  ranges
    .iter()
    .flat_map(|(range, host)| range.clone().map(move |item| (item, *host)))
    .collect()
}
