//! tests/failover.rs
//! Items left running by a crashed instance are taken over exactly once.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{
  build_host, expected_assignment, item_exec_held, item_exec_logged, item_exec_stallable, job_config, settle,
  setup_job, setup_tracing, wait_until, ItemLog, JOB,
};
use futures::future::join_all;
use shardkeeper::store::CoordinatorStore;
use shardkeeper::{JobHandle, MemoryCluster};
use tracing::info;

async fn run_cycles(handles: &[&JobHandle]) {
  let cycles = handles
    .iter()
    .map(|handle| tokio::time::timeout(StdDuration::from_millis(500), handle.run_one_cycle()));
  let _ = join_all(cycles).await;
}

#[tokio::test]
async fn test_crashed_instance_items_fail_over_once() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let stall = Arc::new(AtomicBool::new(false));

  let h1 = build_host(&cluster, "i1", 4);
  let h2 = build_host(&cluster, "i2", 4);
  let h3 = build_host(&cluster, "i3", 4);
  let config = || job_config(3).failover(true).build();
  let j1 = setup_job(&h1.host, config(), item_exec_logged(log.clone(), "i1", StdDuration::ZERO)).await;
  let j2 = setup_job(&h2.host, config(), item_exec_logged(log.clone(), "i2", StdDuration::ZERO)).await;
  let j3 = setup_job(
    &h3.host,
    config(),
    item_exec_stallable(log.clone(), "i3", stall.clone(), StdDuration::from_secs(30)),
  )
  .await;

  let three = expected_assignment(&[(0..=0, "i1"), (1..=1, "i2"), (2..=2, "i3")]);
  assert!(settle(&cluster, &[&j1, &j2, &j3], &three).await);
  log.clear();

  // i3 starts item 2 and hangs in it.
  stall.store(true, Ordering::SeqCst);
  let _stuck = tokio::spawn({
    let j3 = j3.clone();
    async move { j3.run_one_cycle().await }
  });
  let marker = format!("/{}/sharding/2/running", JOB);
  let running = wait_until(StdDuration::from_secs(2), || {
    let cluster = cluster.clone();
    let marker = marker.clone();
    async move { cluster.get(&marker).is_some() }
  })
  .await;
  assert!(running, "i3 never marked item 2 as running");
  assert_eq!(log.runs_on("i3"), vec![2]);

  info!("Expiring i3's session...");
  cluster.expire_session(h3.store.session_id());
  assert!(
    cluster.get(&marker).is_some(),
    "Running markers of failover jobs outlive their owner's session"
  );

  // The survivors' watch handlers queue and claim the orphan on their own.
  let claim = format!("/{}/sharding/2/failover", JOB);
  let claimed = wait_until(StdDuration::from_secs(3), || {
    let cluster = cluster.clone();
    let claim = claim.clone();
    async move { cluster.get(&claim).is_some() }
  })
  .await;
  assert!(claimed, "Item 2 was never claimed");
  let claimant = cluster.get(&claim).unwrap();
  assert!(claimant == "i1@-@0" || claimant == "i2@-@0", "Unexpected claimant {}", claimant);

  let taken_over = wait_until(StdDuration::from_secs(5), || {
    let log = log.clone();
    let (j1, j2) = (j1.clone(), j2.clone());
    async move {
      run_cycles(&[&j1, &j2]).await;
      log.count(2) >= 2
    }
  })
  .await;
  assert!(taken_over, "No survivor executed item 2");

  let claimed = j1.metrics().failover_claimed + j2.metrics().failover_claimed;
  assert_eq!(claimed, 1, "Item 2 must be claimed exactly once");
  assert!(cluster.paths_under(&format!("/{}/failover", JOB)).is_empty());

  let two = expected_assignment(&[(0..=1, "i1"), (2..=2, "i2")]);
  assert!(settle(&cluster, &[&j1, &j2], &two).await);
  assert_eq!(
    j1.metrics().failover_claimed + j2.metrics().failover_claimed,
    1,
    "Normal reassignment must not claim again"
  );
  assert!(cluster.get(&format!("/{}/sharding/2/failover", JOB)).is_none());
}

#[tokio::test]
async fn test_without_failover_markers_vanish_with_session() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let stall = Arc::new(AtomicBool::new(false));

  let h1 = build_host(&cluster, "i1", 2);
  let h2 = build_host(&cluster, "i2", 2);
  let j1 = setup_job(&h1.host, job_config(2).build(), item_exec_logged(log.clone(), "i1", StdDuration::ZERO)).await;
  let j2 = setup_job(
    &h2.host,
    job_config(2).build(),
    item_exec_stallable(log.clone(), "i2", stall.clone(), StdDuration::from_secs(30)),
  )
  .await;
  let both = expected_assignment(&[(0..=0, "i1"), (1..=1, "i2")]);
  assert!(settle(&cluster, &[&j1, &j2], &both).await);
  log.clear();

  stall.store(true, Ordering::SeqCst);
  let _stuck = tokio::spawn({
    let j2 = j2.clone();
    async move { j2.run_one_cycle().await }
  });
  let marker = format!("/{}/sharding/1/running", JOB);
  let running = wait_until(StdDuration::from_secs(2), || {
    let cluster = cluster.clone();
    let marker = marker.clone();
    async move { cluster.get(&marker).is_some() }
  })
  .await;
  assert!(running);

  cluster.expire_session(h2.store.session_id());
  assert!(cluster.get(&marker).is_none());

  let alone = expected_assignment(&[(0..=1, "i1")]);
  assert!(settle(&cluster, &[&j1], &alone).await);
  assert_eq!(j1.metrics().failover_claimed, 0);
  assert!(cluster.paths_under(&format!("/{}/failover", JOB)).is_empty());
}

#[tokio::test]
async fn test_restart_under_same_id_releases_own_markers() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let hold = Arc::new(AtomicBool::new(true));

  let crashed = build_host(&cluster, "i1", 2);
  let config = || job_config(1).failover(true).build();
  let job = setup_job(&crashed.host, config(), item_exec_held(log.clone(), "crashed", hold.clone())).await;
  let _stuck = tokio::spawn({
    let job = job.clone();
    async move { job.run_one_cycle().await }
  });
  let marker = format!("/{}/sharding/0/running", JOB);
  let running = wait_until(StdDuration::from_secs(2), || {
    let cluster = cluster.clone();
    let marker = marker.clone();
    async move { cluster.get(&marker).is_some() }
  })
  .await;
  assert!(running);

  info!("Crashing i1 and bringing it back under the same id...");
  cluster.expire_session(crashed.store.session_id());
  assert_eq!(cluster.get(&marker).as_deref(), Some("i1@-@0"));

  let restarted = build_host(&cluster, "i1", 2);
  let job = setup_job(&restarted.host, config(), item_exec_logged(log.clone(), "restarted", StdDuration::ZERO)).await;
  assert!(cluster.get(&marker).is_none(), "Leftover marker of the previous run was kept");

  for _ in 0..3 {
    tokio::time::timeout(StdDuration::from_secs(2), job.run_one_cycle())
      .await
      .expect("Cycle hung after restart")
      .unwrap();
  }
  assert_eq!(log.runs_on("restarted"), vec![0, 0, 0]);
  assert!(job.metrics().reshards_published >= 1);
  assert_eq!(job.metrics().misfires_recorded, 0);
  hold.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn test_marker_left_by_failed_completion_does_not_block_cycles() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let h1 = build_host(&cluster, "i1", 2);
  let job = setup_job(
    &h1.host,
    job_config(2).failover(true).build(),
    item_exec_logged(log.clone(), "i1", StdDuration::ZERO),
  )
  .await;
  let all = expected_assignment(&[(0..=1, "i1")]);
  assert!(settle(&cluster, &[&job], &all).await);

  // A marker this process is not executing, as a failed completion leaves it.
  let marker = format!("/{}/sharding/1/running", JOB);
  h1.store.persist(&marker, "i1@-@0").await.unwrap();
  job.disable_item(0).await.unwrap();
  log.clear();

  tokio::time::timeout(StdDuration::from_secs(2), job.run_one_cycle())
    .await
    .expect("Leader waited on its own stale marker")
    .unwrap();
  assert_eq!(log.runs_on("i1"), vec![1]);
  assert!(cluster.get(&marker).is_none());
}
