//! tests/misfire.rs
//! Triggers arriving while items still run are recorded and caught up.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{
  build_host, expected_assignment, item_exec_stallable, job_config, settle, setup_job, setup_tracing, wait_until,
  ItemLog, JOB,
};
use shardkeeper::MemoryCluster;
use tracing::info;

#[tokio::test]
async fn test_misfired_trigger_is_caught_up() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let stall = Arc::new(AtomicBool::new(false));
  let h1 = build_host(&cluster, "i1", 2);
  let job = setup_job(
    &h1.host,
    job_config(1).build(),
    item_exec_stallable(log.clone(), "i1", stall.clone(), StdDuration::from_millis(400)),
  )
  .await;
  assert!(settle(&cluster, &[&job], &expected_assignment(&[(0..=0, "i1")])).await);
  log.clear();

  stall.store(true, Ordering::SeqCst);
  let first = tokio::spawn({
    let job = job.clone();
    async move { job.run_one_cycle().await }
  });
  let started = wait_until(StdDuration::from_secs(2), || {
    let log = log.clone();
    async move { log.count(0) == 1 }
  })
  .await;
  assert!(started, "First cycle never started item 0");
  // Later runs of the item finish immediately.
  stall.store(false, Ordering::SeqCst);

  info!("Triggering while item 0 is still running...");
  job.run_one_cycle().await.unwrap();
  assert_eq!(log.count(0), 1, "A misfired trigger must not run the item");
  assert!(cluster.get(&format!("/{}/sharding/0/misfire", JOB)).is_some());

  first.await.unwrap().unwrap();
  assert_eq!(log.count(0), 2, "The first cycle should catch the misfire up");
  assert!(cluster.get(&format!("/{}/sharding/0/misfire", JOB)).is_none());
  assert!(cluster.get(&format!("/{}/sharding/0/running", JOB)).is_none());

  let metrics = job.metrics();
  assert_eq!(metrics.misfires_recorded, 1);
  assert_eq!(metrics.misfire_catch_ups, 1);
}

#[tokio::test]
async fn test_misfire_disabled_skips_without_catch_up() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let stall = Arc::new(AtomicBool::new(false));
  let h1 = build_host(&cluster, "i1", 2);
  let job = setup_job(
    &h1.host,
    job_config(1).misfire(false).build(),
    item_exec_stallable(log.clone(), "i1", stall.clone(), StdDuration::from_millis(300)),
  )
  .await;
  assert!(settle(&cluster, &[&job], &expected_assignment(&[(0..=0, "i1")])).await);
  log.clear();

  stall.store(true, Ordering::SeqCst);
  let first = tokio::spawn({
    let job = job.clone();
    async move { job.run_one_cycle().await }
  });
  let started = wait_until(StdDuration::from_secs(2), || {
    let log = log.clone();
    async move { log.count(0) == 1 }
  })
  .await;
  assert!(started);
  stall.store(false, Ordering::SeqCst);

  job.run_one_cycle().await.unwrap();
  first.await.unwrap().unwrap();
  assert_eq!(log.count(0), 1, "Without misfire the skipped trigger is lost");
  assert_eq!(job.metrics().misfires_recorded, 1);
  assert_eq!(job.metrics().misfire_catch_ups, 0);
}
