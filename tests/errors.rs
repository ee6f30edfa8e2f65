//! tests/errors.rs
//! Item failures, panics and listener errors are isolated and routed to the
//! job's error handler; setup errors are reported.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{
  build_host, item_exec_counter_result, item_exec_logged, item_exec_panic_on, job_config, setup_job, setup_tracing,
  ItemLog, JOB,
};
use shardkeeper::{
  BuildError, ChannelErrorHandler, ConfigError, CycleError, ErrorHandlerRegistry, InstanceId, JobError, JobHost,
  JobListener, MemoryCluster, ShardingContexts,
};

#[tokio::test]
async fn test_failing_item_does_not_stop_others() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let h1 = build_host(&cluster, "i1", 4);
  let counter = Arc::new(AtomicUsize::new(0));
  let job = setup_job(&h1.host, job_config(4).build(), item_exec_counter_result(counter.clone(), vec![1])).await;

  job.run_one_cycle().await.expect("LOG handler swallows item errors");
  assert_eq!(counter.load(Ordering::SeqCst), 4);
  let metrics = job.metrics();
  assert_eq!(metrics.items_succeeded, 3);
  assert_eq!(metrics.items_failed, 1);
  assert_eq!(metrics.item_execution_duration_count, 4);
  assert!(metrics.mean_execution_duration().is_some());
  assert!(cluster.paths_under(&format!("/{}/sharding/1/running", JOB)).is_empty());
}

#[tokio::test]
async fn test_propagate_handler_returns_item_errors_after_bookkeeping() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let h1 = build_host(&cluster, "i1", 4);
  let counter = Arc::new(AtomicUsize::new(0));
  let config = job_config(3).error_handler_type("PROPAGATE").build();
  let job = setup_job(&h1.host, config, item_exec_counter_result(counter.clone(), vec![2])).await;

  match job.run_one_cycle().await {
    Err(CycleError::Propagated(errors)) => {
      assert_eq!(errors.len(), 1);
      assert!(matches!(&errors[0], JobError::ItemFailed { item: 2, .. }), "Got {:?}", errors[0]);
    }
    other => panic!("Expected propagated errors, got {:?}", other),
  }
  assert_eq!(counter.load(Ordering::SeqCst), 3);
  for item in 0..3 {
    assert!(cluster.get(&format!("/{}/sharding/{}/running", JOB, item)).is_none());
  }
}

#[tokio::test]
async fn test_item_panics_are_contained() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let h1 = build_host(&cluster, "i1", 4);
  let counter = Arc::new(AtomicUsize::new(0));
  let job = setup_job(&h1.host, job_config(3).build(), item_exec_panic_on(1, counter.clone())).await;

  job.run_one_cycle().await.unwrap();
  assert_eq!(counter.load(Ordering::SeqCst), 2);
  assert_eq!(job.metrics().items_panicked, 1);

  // A lone item runs inline and is contained the same way.
  job.disable_item(0).await.unwrap();
  job.disable_item(2).await.unwrap();
  job.run_one_cycle().await.unwrap();
  assert_eq!(job.metrics().items_panicked, 2);
  assert!(!job.is_running());
}

struct FlakyListener {
  after_calls: Arc<AtomicUsize>,
}

impl JobListener for FlakyListener {
  fn name(&self) -> &str {
    "flaky"
  }

  fn before_job_executed(&self, contexts: &ShardingContexts) -> Result<(), String> {
    Err(format!("not ready for {:?}", contexts.item_numbers()))
  }

  fn after_job_executed(&self, _contexts: &ShardingContexts) -> Result<(), String> {
    self.after_calls.fetch_add(1, Ordering::SeqCst);
    panic!("listener exploded");
  }
}

#[tokio::test]
async fn test_listener_errors_are_routed_to_handler() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let log = ItemLog::default();
  let (notifier, mut notifications) = ChannelErrorHandler::new();
  let mut handlers = ErrorHandlerRegistry::default();
  handlers.register_instance("NOTIFY", Arc::new(notifier));
  let host = JobHost::builder()
    .store(Arc::new(cluster.connect()))
    .instance_id(InstanceId::new("i1", "0"))
    .max_workers(2)
    .error_handlers(handlers)
    .build()
    .unwrap();

  let after_calls = Arc::new(AtomicUsize::new(0));
  let listener: Arc<dyn JobListener> = Arc::new(FlakyListener {
    after_calls: after_calls.clone(),
  });
  let job = host
    .setup(
      job_config(2).error_handler_type("NOTIFY").build(),
      item_exec_logged(log.clone(), "i1", StdDuration::ZERO),
      vec![listener],
    )
    .await
    .unwrap();

  job.run_one_cycle().await.unwrap();
  assert_eq!(log.runs_on("i1"), vec![0, 1], "Listener failures must not block items");
  assert_eq!(after_calls.load(Ordering::SeqCst), 1);
  assert_eq!(job.metrics().listener_errors, 2);

  let mut failures = Vec::new();
  while let Ok((_, error)) = notifications.try_recv() {
    failures.push(error);
  }
  assert_eq!(failures.len(), 2);
  assert!(failures
    .iter()
    .all(|e| matches!(e, JobError::ListenerFailed { listener, .. } if listener == "flaky")));
}

#[tokio::test]
async fn test_conflicting_job_type_is_rejected() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let h1 = build_host(&cluster, "i1", 1);
  let h2 = build_host(&cluster, "i2", 1);
  let counter = Arc::new(AtomicUsize::new(0));
  setup_job(&h1.host, job_config(2).build(), item_exec_counter_result(counter.clone(), vec![])).await;

  let other = job_config(2).job_type("ReportJob").build();
  let err = h2
    .host
    .setup(other, item_exec_counter_result(counter.clone(), vec![]), Vec::new())
    .await
    .unwrap_err();
  assert!(matches!(err, ConfigError::ConfigurationConflict { .. }), "Got {:?}", err);
  assert!(h2.host.job(JOB).is_none());
}

#[tokio::test]
async fn test_setup_errors() {
  setup_tracing();
  let cluster = MemoryCluster::new();
  let h1 = build_host(&cluster, "i1", 1);
  let counter = Arc::new(AtomicUsize::new(0));

  let unknown = job_config(2).sharding_strategy_type("NEAREST").build();
  let err = h1
    .host
    .setup(unknown, item_exec_counter_result(counter.clone(), vec![]), Vec::new())
    .await
    .unwrap_err();
  assert_eq!(err, ConfigError::Build(BuildError::UnknownStrategy("NEAREST".to_string())));

  let zero = job_config(0).build();
  let err = h1
    .host
    .setup(zero, item_exec_counter_result(counter.clone(), vec![]), Vec::new())
    .await
    .unwrap_err();
  assert!(matches!(err, ConfigError::InvalidConfiguration { .. }));

  setup_job(&h1.host, job_config(2).build(), item_exec_counter_result(counter.clone(), vec![])).await;
  let err = h1
    .host
    .setup(job_config(2).build(), item_exec_counter_result(counter.clone(), vec![]), Vec::new())
    .await
    .unwrap_err();
  assert_eq!(err, ConfigError::AlreadyRegistered(JOB.to_string()));
}

#[test]
fn test_builder_requires_store_and_workers() {
  let err = JobHost::builder().max_workers(1).build().unwrap_err();
  assert_eq!(err, BuildError::MissingStore);

  let cluster = MemoryCluster::new();
  let err = JobHost::builder()
    .store(Arc::new(cluster.connect()))
    .max_workers(0)
    .build()
    .unwrap_err();
  assert_eq!(err, BuildError::MissingOrZeroMaxWorkers);
}
