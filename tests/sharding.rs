//! tests/sharding.rs
//! Assignment publication, resharding on membership changes, disabled items
//! and leader election across several hosts.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{
  build_host, expected_assignment, item_exec_held, item_exec_logged, job_config, settle, setup_job, setup_tracing,
  wait_until, ItemLog, JOB,
};
use shardkeeper::store::CoordinatorStore;
use shardkeeper::MemoryCluster;
use tracing::info;

#[tokio::test]
async fn test_assignment_shrinks_when_instance_leaves() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();

  let h1 = build_host(&cluster, "i1", 4);
  let h2 = build_host(&cluster, "i2", 4);
  let h3 = build_host(&cluster, "i3", 4);
  let j1 = setup_job(&h1.host, job_config(9).build(), item_exec_logged(log.clone(), "i1", StdDuration::ZERO)).await;
  let j2 = setup_job(&h2.host, job_config(9).build(), item_exec_logged(log.clone(), "i2", StdDuration::ZERO)).await;
  let j3 = setup_job(&h3.host, job_config(9).build(), item_exec_logged(log.clone(), "i3", StdDuration::ZERO)).await;

  assert!(j1.is_leader().await.unwrap(), "First instance up should lead");
  let three = expected_assignment(&[(0..=2, "i1"), (3..=5, "i2"), (6..=8, "i3")]);
  assert!(settle(&cluster, &[&j1, &j2, &j3], &three).await, "Initial assignment not published");

  log.clear();
  j1.run_one_cycle().await.unwrap();
  assert_eq!(log.runs_on("i1"), vec![0, 1, 2]);

  info!("Shutting down i2...");
  j2.shutdown_graceful(Some(StdDuration::from_secs(2))).await.unwrap();
  assert!(cluster.paths_under(&format!("/{}/servers/i2@-@0", JOB)).is_empty());

  let two = expected_assignment(&[(0..=4, "i1"), (5..=8, "i3")]);
  assert!(settle(&cluster, &[&j1, &j3], &two).await, "Assignment not republished");

  log.clear();
  let (r1, r3) = tokio::join!(j1.run_one_cycle(), j3.run_one_cycle());
  r1.unwrap();
  r3.unwrap();
  assert_eq!(log.runs_on("i1"), vec![0, 1, 2, 3, 4]);
  assert_eq!(log.runs_on("i3"), vec![5, 6, 7, 8]);
  assert_eq!(log.runs_on("i2"), Vec::<u32>::new());
  assert_eq!(j3.local_items().await.unwrap(), vec![5, 6, 7, 8]);
  assert!(j1.metrics().reshards_published >= 2);
  assert_eq!(j3.metrics().reshards_published, 0, "Only the leader publishes");
}

#[tokio::test]
async fn test_every_item_has_one_owner() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();

  let h1 = build_host(&cluster, "i1", 4);
  let h2 = build_host(&cluster, "i2", 4);
  let j1 = setup_job(&h1.host, job_config(5).build(), item_exec_logged(log.clone(), "i1", StdDuration::ZERO)).await;
  let j2 = setup_job(&h2.host, job_config(5).build(), item_exec_logged(log.clone(), "i2", StdDuration::ZERO)).await;

  let expected = expected_assignment(&[(0..=2, "i1"), (3..=4, "i2")]);
  assert!(settle(&cluster, &[&j1, &j2], &expected).await);

  log.clear();
  let (r1, r2) = tokio::join!(j1.run_one_cycle(), j2.run_one_cycle());
  r1.unwrap();
  r2.unwrap();
  for item in 0..5 {
    assert_eq!(log.count(item), 1, "Item {} should run exactly once per trigger", item);
  }
}

#[tokio::test]
async fn test_disabled_item_is_skipped_until_enabled() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let h1 = build_host(&cluster, "i1", 2);
  let job = setup_job(&h1.host, job_config(3).build(), item_exec_logged(log.clone(), "i1", StdDuration::ZERO)).await;
  let all = expected_assignment(&[(0..=2, "i1")]);
  assert!(settle(&cluster, &[&job], &all).await);

  job.disable_item(1).await.unwrap();
  log.clear();
  job.run_one_cycle().await.unwrap();
  assert_eq!(log.runs_on("i1"), vec![0, 2]);

  job.enable_item(1).await.unwrap();
  log.clear();
  job.run_one_cycle().await.unwrap();
  assert_eq!(log.runs_on("i1"), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_leader_is_reelected_after_session_loss() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let h1 = build_host(&cluster, "i1", 2);
  let h2 = build_host(&cluster, "i2", 2);
  let j1 = setup_job(&h1.host, job_config(4).build(), item_exec_logged(log.clone(), "i1", StdDuration::ZERO)).await;
  let j2 = setup_job(&h2.host, job_config(4).build(), item_exec_logged(log.clone(), "i2", StdDuration::ZERO)).await;

  assert!(j1.is_leader().await.unwrap());
  assert!(!j2.is_leader().await.unwrap());

  info!("Expiring leader session...");
  cluster.expire_session(h1.store.session_id());
  let took_over = wait_until(StdDuration::from_secs(3), || {
    let j2 = j2.clone();
    async move { j2.is_leader().await.unwrap_or(false) }
  })
  .await;
  assert!(took_over, "Survivor should take over leadership");

  let alone = expected_assignment(&[(0..=3, "i2")]);
  assert!(settle(&cluster, &[&j2], &alone).await, "New leader should reshard");
}

#[tokio::test]
async fn test_strategy_is_chosen_by_name() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let h1 = build_host(&cluster, "i1", 2);
  let h2 = build_host(&cluster, "i2", 2);
  let config = || job_config(4).sharding_strategy_type("ROUND_ROBIN").build();
  let j1 = setup_job(&h1.host, config(), item_exec_logged(log.clone(), "i1", StdDuration::ZERO)).await;
  let j2 = setup_job(&h2.host, config(), item_exec_logged(log.clone(), "i2", StdDuration::ZERO)).await;

  // The hash of "settlement" is odd, so two instances are rotated by one.
  let reversed = expected_assignment(&[(0..=1, "i2"), (2..=3, "i1")]);
  assert!(settle(&cluster, &[&j1, &j2], &reversed).await);
}

#[tokio::test]
async fn test_leader_defers_resharding_while_items_run() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let hold = Arc::new(AtomicBool::new(false));
  let h1 = build_host(&cluster, "i1", 2);
  let h2 = build_host(&cluster, "i2", 2);
  let j1 = setup_job(&h1.host, job_config(2).build(), item_exec_logged(log.clone(), "i1", StdDuration::ZERO)).await;
  let j2 = setup_job(&h2.host, job_config(2).build(), item_exec_held(log.clone(), "i2", hold.clone())).await;
  let both = expected_assignment(&[(0..=0, "i1"), (1..=1, "i2")]);
  assert!(settle(&cluster, &[&j1, &j2], &both).await);
  assert!(j1.is_leader().await.unwrap());

  // i2 keeps item 1 busy.
  hold.store(true, Ordering::SeqCst);
  let follower_cycle = tokio::spawn({
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
  assert!(running, "i2 never marked item 1 as running");

  let published_before = j1.metrics().reshards_published;
  j1.disable_item(0).await.unwrap();
  let necessary = format!("/{}/sharding/necessary", JOB);
  assert!(cluster.get(&necessary).is_some());

  let leader_cycle = tokio::spawn({
    let j1 = j1.clone();
    async move { j1.run_one_cycle().await }
  });
  tokio::time::sleep(StdDuration::from_millis(300)).await;
  assert_eq!(j1.metrics().reshards_published, published_before, "Published while item 1 was running");
  assert!(cluster.get(&necessary).is_some());
  assert!(cluster.get(&format!("/{}/sharding/processing", JOB)).is_none());
  assert!(!leader_cycle.is_finished());

  info!("Releasing item 1...");
  hold.store(false, Ordering::SeqCst);
  tokio::time::timeout(StdDuration::from_secs(3), leader_cycle)
    .await
    .expect("Leader cycle did not finish")
    .unwrap()
    .unwrap();
  follower_cycle.await.unwrap().unwrap();
  assert_eq!(j1.metrics().reshards_published, published_before + 1);
  assert!(cluster.get(&necessary).is_none());
  assert!(cluster.get(&marker).is_none());
}
