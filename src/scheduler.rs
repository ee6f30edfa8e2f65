use crate::command::{ShutdownMode, TriggerCommand};
use crate::config::{ConfigurationGateway, JobConfiguration};
use crate::election::LeaderElection;
use crate::error::{BuildError, ConfigError, CycleError, ShutdownError};
use crate::execution::ExecutionTracker;
use crate::failover::{FailoverQueue, DEFAULT_FAILOVER_CAPACITY};
use crate::handler::ErrorHandlerRegistry;
use crate::instance::{InstanceId, InstanceRegistry};
use crate::job::{BoxedItemFn, JobListener, Schedule};
use crate::listener::WatchHandlers;
use crate::metrics::{JobMetrics, MetricsSnapshot};
use crate::orchestrator::CycleOrchestrator;
use crate::poll::{PollSettings, DEFAULT_POLL_INITIAL, DEFAULT_POLL_MAX};
use crate::registry::JobRegistry;
use crate::sharding::strategy::StrategyRegistry;
use crate::sharding::ShardingCoordinator;
use crate::storage::JobNodeStorage;
use crate::store::CoordinatorStore;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_COMMAND_BOUND: usize = 16;
const DEFAULT_HOST_NAME: &str = "127.0.0.1";

/// Builder for configuring and creating a [`JobHost`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use shardkeeper::{JobHost, store::MemoryCluster};
///
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let cluster = MemoryCluster::new();
/// let host = JobHost::builder()
///     .store(Arc::new(cluster.connect()))
///     .host_name("10.0.0.7")
///     .max_workers(4)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct JobHostBuilder {
  store: Option<Arc<dyn CoordinatorStore>>,
  host_name: String,
  instance_id: Option<InstanceId>,
  max_workers: Option<usize>,
  failover_queue_capacity: usize,
  poll_initial: Duration,
  poll_max: Duration,
  command_buffer_size: usize,
  strategies: StrategyRegistry,
  error_handlers: ErrorHandlerRegistry,
}

impl Default for JobHostBuilder {
  fn default() -> Self {
    Self {
      store: None,
      host_name: DEFAULT_HOST_NAME.to_string(),
      instance_id: None,
      max_workers: None,
      failover_queue_capacity: DEFAULT_FAILOVER_CAPACITY,
      poll_initial: DEFAULT_POLL_INITIAL,
      poll_max: DEFAULT_POLL_MAX,
      command_buffer_size: DEFAULT_COMMAND_BOUND,
      strategies: StrategyRegistry::default(),
      error_handlers: ErrorHandlerRegistry::default(),
    }
  }
}

impl JobHostBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// The coordination store session every job on this host uses (required).
  pub fn store(mut self, store: Arc<dyn CoordinatorStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Host part of the generated instance id.
  pub fn host_name(mut self, host_name: &str) -> Self {
    self.host_name = host_name.to_string();
    self
  }

  /// Uses a fixed instance id instead of generating one.
  pub fn instance_id(mut self, instance_id: InstanceId) -> Self {
    self.instance_id = Some(instance_id);
    self
  }

  /// Sets the maximum number of items executing concurrently across all
  /// jobs of the host (required, greater than 0).
  pub fn max_workers(mut self, count: usize) -> Self {
    self.max_workers = Some(count);
    self
  }

  pub fn failover_queue_capacity(mut self, capacity: usize) -> Self {
    self.failover_queue_capacity = capacity;
    self
  }

  /// Bounds for the sleep-poll used while waiting on elections and resharding.
  pub fn poll_interval(mut self, initial: Duration, max: Duration) -> Self {
    self.poll_initial = initial;
    self.poll_max = max;
    self
  }

  /// Sets the size of each job's trigger command buffer.
  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.command_buffer_size = size.max(1);
    self
  }

  pub fn strategies(mut self, strategies: StrategyRegistry) -> Self {
    self.strategies = strategies;
    self
  }

  pub fn error_handlers(mut self, error_handlers: ErrorHandlerRegistry) -> Self {
    self.error_handlers = error_handlers;
    self
  }

  /// Builds the `JobHost`. Jobs are added with [`JobHost::setup`].
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingStore`] if no store was given.
  /// - [`BuildError::MissingOrZeroMaxWorkers`] if `max_workers` is unset or 0.
  pub fn build(self) -> Result<JobHost, BuildError> {
    let store = self.store.ok_or(BuildError::MissingStore)?;
    let max_workers = self
      .max_workers
      .filter(|count| *count > 0)
      .ok_or(BuildError::MissingOrZeroMaxWorkers)?;
    let instance_id = self
      .instance_id
      .unwrap_or_else(|| InstanceId::generate(&self.host_name));
    info!(instance = %instance_id, max_workers, "Job host built.");

    Ok(JobHost {
      store,
      instance_id,
      registry: JobRegistry::default(),
      workers: Arc::new(Semaphore::new(max_workers)),
      failover_queue_capacity: self.failover_queue_capacity,
      poll_initial: self.poll_initial,
      poll_max: self.poll_max,
      command_buffer_size: self.command_buffer_size,
      strategies: Arc::new(self.strategies),
      error_handlers: Arc::new(self.error_handlers),
    })
  }
}

/// One participating process: sets up sharding jobs against a coordination
/// store and runs their cycles.
///
/// Use [`JobHost::builder()`] to create and configure an instance.
#[derive(Debug)]
pub struct JobHost {
  store: Arc<dyn CoordinatorStore>,
  instance_id: InstanceId,
  registry: JobRegistry,
  workers: Arc<Semaphore>,
  failover_queue_capacity: usize,
  poll_initial: Duration,
  poll_max: Duration,
  command_buffer_size: usize,
  strategies: Arc<StrategyRegistry>,
  error_handlers: Arc<ErrorHandlerRegistry>,
}

impl JobHost {
  /// Returns a builder to configure and create a `JobHost`.
  pub fn builder() -> JobHostBuilder {
    JobHostBuilder::new()
  }

  pub fn instance_id(&self) -> &InstanceId {
    &self.instance_id
  }

  /// Registers `config` (or checks it against the registered one), joins this
  /// instance to the job, and starts its watch handlers.
  ///
  /// No cycle runs until [`JobHandle::run_one_cycle`] or
  /// [`JobHandle::schedule_recurring`] is called.
  ///
  /// # Errors
  ///
  /// - [`ConfigError::ConfigurationConflict`] if the job name is registered
  ///   with a different job type.
  /// - [`ConfigError::InvalidConfiguration`], unknown strategy or error
  ///   handler names, store failures.
  pub async fn setup(
    &self,
    config: JobConfiguration,
    item_fn: BoxedItemFn,
    listeners: Vec<Arc<dyn JobListener>>,
  ) -> Result<JobHandle, ConfigError> {
    config.validate()?;
    let job_name = config.job_name.clone();
    if self.registry.contains(&job_name) {
      return Err(ConfigError::AlreadyRegistered(job_name));
    }
    self.strategies.resolve(&config.sharding_strategy_type)?;
    self.error_handlers.resolve(&config.error_handler_type)?;

    let storage = JobNodeStorage::new(self.store.clone(), &job_name);
    let gateway = ConfigurationGateway::new(storage.clone());
    gateway.check_conflict(&config).await?;
    gateway.persist(&config).await?;
    // The registered configuration wins over the local one unless it was overwritten.
    let registered = gateway.load(false).await?;
    self.strategies.resolve(&registered.sharding_strategy_type)?;
    let error_handler = self.error_handlers.resolve(&registered.error_handler_type)?;

    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (trigger_tx, trigger_rx) = mpsc::channel::<TriggerCommand>(self.command_buffer_size);
    let metrics = JobMetrics::new();
    let poll = PollSettings::new(self.poll_initial, self.poll_max);

    let instances = InstanceRegistry::new(storage.clone(), self.instance_id.clone());
    let election = LeaderElection::new(storage.clone(), instances.clone(), poll.clone());
    let tracker = ExecutionTracker::new(storage.clone(), gateway.clone(), instances.clone());
    let failover = FailoverQueue::new(
      storage.clone(),
      gateway.clone(),
      tracker.clone(),
      instances.clone(),
      self.failover_queue_capacity,
      metrics.clone(),
    );
    let sharding = ShardingCoordinator::new(
      storage.clone(),
      gateway.clone(),
      instances.clone(),
      election.clone(),
      tracker.clone(),
      self.strategies.clone(),
      poll.clone(),
      metrics.clone(),
      shutdown_rx.clone(),
    );

    // Subscribe before joining so our own join is observed like any other.
    let events = storage.subscribe()?;
    instances.register().await?;
    // Nothing runs yet, so any marker naming us predates this process.
    let stale = tracker.release_stale_markers().await?;
    if !stale.is_empty() {
      info!(job_name = %job_name, items = ?stale, "Cleared running markers left by a previous run.");
    }
    sharding.set_resharding_flag().await?;
    election.elect().await?;

    let handlers = WatchHandlers {
      path: storage.node_path().clone(),
      config: gateway.clone(),
      sharding: sharding.clone(),
      election: election.clone(),
      instances: instances.clone(),
      failover: failover.clone(),
      poll,
      trigger_tx: trigger_tx.clone(),
    };
    let tasks = handlers.spawn(events, shutdown_rx.clone());

    let orchestrator = CycleOrchestrator {
      config: gateway,
      sharding: sharding.clone(),
      tracker: tracker.clone(),
      failover,
      instances: instances.clone(),
      error_handler,
      item_fn: Arc::new(item_fn),
      listeners: Arc::new(listeners),
      workers: self.workers.clone(),
      metrics: metrics.clone(),
      shutdown_rx,
      trigger_tx: trigger_tx.clone(),
      job_name: job_name.clone(),
    };
    let controller = Arc::new(JobController {
      name: job_name.clone(),
      orchestrator,
      sharding,
      tracker,
      election,
      instances,
      metrics,
      shutdown_tx,
      trigger_tx,
      trigger_rx: Mutex::new(Some(trigger_rx)),
      tasks: Mutex::new(tasks),
    });
    self.registry.insert(controller.clone())?;
    info!(job_name = %job_name, instance = %self.instance_id, "Job set up.");

    Ok(JobHandle {
      controller,
      registry: self.registry.clone(),
    })
  }

  /// The handle of a job set up on this host.
  pub fn job(&self, job_name: &str) -> Option<JobHandle> {
    self.registry.get(job_name).map(|controller| JobHandle {
      controller,
      registry: self.registry.clone(),
    })
  }

  pub fn job_names(&self) -> Vec<String> {
    self.registry.names()
  }

  pub async fn run_one_cycle(&self, job_name: &str) -> Result<(), CycleError> {
    self
      .registry
      .get(job_name)
      .ok_or_else(|| CycleError::JobNotFound(job_name.to_string()))?
      .run_cycle()
      .await
  }

  /// Gracefully shuts down one job; see [`JobHandle::shutdown_graceful`].
  pub async fn shutdown(&self, job_name: &str, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let controller = self
      .registry
      .remove(job_name)
      .ok_or_else(|| ShutdownError::JobNotFound(job_name.to_string()))?;
    controller.shutdown(ShutdownMode::Graceful, timeout).await
  }

  /// Gracefully shuts down every job. Returns the first error after
  /// attempting all of them.
  pub async fn shutdown_all(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let mut first_error = None;
    for name in self.registry.names() {
      if let Err(e) = self.shutdown(&name, timeout).await {
        error!(job_name = %name, error = %e, "Job shutdown failed.");
        first_error.get_or_insert(e);
      }
    }
    first_error.map_or(Ok(()), Err)
  }
}

/// Handle to one job set up on a [`JobHost`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobHandle {
  controller: Arc<JobController>,
  registry: JobRegistry,
}

impl JobHandle {
  pub fn job_name(&self) -> &str {
    self.controller.name()
  }

  pub fn instance_id(&self) -> &InstanceId {
    self.controller.instances.local()
  }

  /// Runs one cycle now on the calling task.
  pub async fn run_one_cycle(&self) -> Result<(), CycleError> {
    self.controller.run_cycle().await
  }

  /// Starts firing cycles on `schedule`. If the job is already scheduled its
  /// schedule is replaced instead.
  pub async fn schedule_recurring(&self, schedule: Schedule) -> Result<(), CycleError> {
    self.controller.schedule_recurring(schedule).await
  }

  /// Runs one extra cycle as soon as possible and waits for its outcome.
  ///
  /// On a scheduled job the cycle runs on the trigger loop, between regular
  /// cycles; otherwise it runs on the calling task.
  pub async fn trigger_now(&self) -> Result<(), CycleError> {
    self.controller.trigger_now().await
  }

  /// Excludes `item` from execution on every instance and reshards.
  pub async fn disable_item(&self, item: u32) -> Result<(), CycleError> {
    self.controller.set_item_disabled(item, true).await
  }

  pub async fn enable_item(&self, item: u32) -> Result<(), CycleError> {
    self.controller.set_item_disabled(item, false).await
  }

  /// The published item → instance map.
  pub async fn assignment(&self) -> Result<BTreeMap<u32, InstanceId>, CycleError> {
    self.controller.sharding.get_assignment().await
  }

  /// Items the published assignment gives to this instance.
  pub async fn local_items(&self) -> Result<Vec<u32>, CycleError> {
    self.controller.sharding.get_local_items().await
  }

  pub async fn is_leader(&self) -> Result<bool, CycleError> {
    Ok(self.controller.election.is_leader().await?)
  }

  /// True while this process executes any item of the job.
  pub fn is_running(&self) -> bool {
    self.controller.tracker.is_job_running()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.controller.metrics.snapshot()
  }

  /// Lets an in-flight cycle finish, stops triggering, resigns leadership
  /// and deregisters this instance before returning.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::JobNotFound`]: the job was already shut down.
  /// - [`ShutdownError::Timeout`]: tasks did not finish in time. The instance
  ///   is deregistered anyway.
  /// - [`ShutdownError::TaskPanic`]: a trigger or watch task panicked.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    self.shutdown(ShutdownMode::Graceful, timeout).await
  }

  /// Like [`JobHandle::shutdown_graceful`] but abandons an in-flight cycle.
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    self.shutdown(ShutdownMode::Force, timeout).await
  }

  async fn shutdown(&self, mode: ShutdownMode, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    self
      .registry
      .remove(self.job_name())
      .ok_or_else(|| ShutdownError::JobNotFound(self.job_name().to_string()))?;
    self.controller.shutdown(mode, timeout).await
  }
}

/// Per-job state owned by the host's registry.
pub(crate) struct JobController {
  name: String,
  orchestrator: CycleOrchestrator,
  sharding: ShardingCoordinator,
  tracker: ExecutionTracker,
  election: LeaderElection,
  instances: InstanceRegistry,
  metrics: JobMetrics,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  trigger_tx: mpsc::Sender<TriggerCommand>,
  // Taken by the trigger loop once the job is scheduled.
  trigger_rx: Mutex<Option<mpsc::Receiver<TriggerCommand>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for JobController {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobController")
      .field("name", &self.name)
      .field("instance", self.instances.local())
      .field("shutdown", &*self.shutdown_tx.borrow())
      .finish()
  }
}

impl JobController {
  pub fn name(&self) -> &str {
    &self.name
  }

  fn is_shut_down(&self) -> bool {
    self.shutdown_tx.borrow().is_some()
  }

  async fn run_cycle(&self) -> Result<(), CycleError> {
    if self.is_shut_down() {
      return Err(CycleError::JobShutdown(self.name.clone()));
    }
    self.orchestrator.run_cycle().await
  }

  async fn schedule_recurring(&self, schedule: Schedule) -> Result<(), CycleError> {
    if self.is_shut_down() {
      return Err(CycleError::JobShutdown(self.name.clone()));
    }
    let receiver = self.trigger_rx.lock().await.take();
    match receiver {
      Some(commands) => {
        let trigger_loop = TriggerLoop {
          orchestrator: self.orchestrator.clone(),
          sharding: self.sharding.clone(),
          schedule,
          commands,
          shutdown_rx: self.shutdown_tx.subscribe(),
        };
        let handle = tokio::spawn(trigger_loop.run());
        self.tasks.lock().await.push(handle);
        info!(job_name = %self.name, "Job scheduled.");
        Ok(())
      }
      None => {
        let (responder, response_rx) = oneshot::channel();
        self
          .trigger_tx
          .send(TriggerCommand::UpdateSchedule { schedule, responder })
          .await
          .map_err(|_| CycleError::JobShutdown(self.name.clone()))?;
        response_rx
          .await
          .map_err(|_| CycleError::JobShutdown(self.name.clone()))
      }
    }
  }

  async fn trigger_now(&self) -> Result<(), CycleError> {
    if self.trigger_rx.lock().await.is_some() {
      return self.run_cycle().await;
    }
    let (responder, response_rx) = oneshot::channel();
    self
      .trigger_tx
      .send(TriggerCommand::RunNow {
        responder: Some(responder),
      })
      .await
      .map_err(|_| CycleError::JobShutdown(self.name.clone()))?;
    response_rx
      .await
      .map_err(|_| CycleError::JobShutdown(self.name.clone()))?
  }

  async fn set_item_disabled(&self, item: u32, disabled: bool) -> Result<(), CycleError> {
    self.tracker.set_disabled(item, disabled).await?;
    self.sharding.set_resharding_flag().await?;
    info!(job_name = %self.name, item, disabled, "Item availability changed.");
    Ok(())
  }

  async fn shutdown(&self, mode: ShutdownMode, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!(job_name = %self.name, ?mode, "Initiating job shutdown...");
    self
      .shutdown_tx
      .send(Some(mode))
      .map_err(|_| ShutdownError::SignalFailed)?;

    let handles = std::mem::take(&mut *self.tasks.lock().await);
    if mode == ShutdownMode::Force {
      for handle in &handles {
        handle.abort();
      }
    }
    let joined = await_tasks(handles, mode, timeout).await;

    // Leave the cluster even if the tasks misbehaved or resigning failed.
    let resigned = self.election.resign().await;
    let deregistered = self.instances.deregister().await;
    resigned?;
    deregistered?;
    if joined.is_ok() {
      info!(job_name = %self.name, "Job shut down.");
    }
    joined
  }
}

async fn await_tasks(
  handles: Vec<JoinHandle<()>>,
  mode: ShutdownMode,
  timeout: Option<Duration>,
) -> Result<(), ShutdownError> {
  let join_all_fut = try_join_all(handles);
  let joined = match timeout {
    Some(timeout) => match tokio::time::timeout(timeout, join_all_fut).await {
      Ok(joined) => joined,
      Err(_) => {
        error!("Shutdown timed out after {:?}", timeout);
        return Err(ShutdownError::Timeout);
      }
    },
    None => join_all_fut.await,
  };
  match joined {
    Ok(_) => Ok(()),
    // Aborted tasks report cancellation, which is what a forced shutdown asked for.
    Err(join_err) if join_err.is_cancelled() && mode == ShutdownMode::Force => Ok(()),
    Err(join_err) => {
      error!("A task panicked during shutdown: {:?}", join_err);
      Err(ShutdownError::TaskPanic)
    }
  }
}

/// Fires cycles for one scheduled job until shutdown.
struct TriggerLoop {
  orchestrator: CycleOrchestrator,
  sharding: ShardingCoordinator,
  schedule: Schedule,
  commands: mpsc::Receiver<TriggerCommand>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
}

impl TriggerLoop {
  async fn run(mut self) {
    let job_name = self.orchestrator.job_name.clone();
    let mut next_run = self.schedule.calculate_next_run(Utc::now());
    loop {
      let wait = next_run.map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO));
      tokio::select! {
        biased;
        changed = self.shutdown_rx.changed() => {
          if changed.is_err() || self.shutdown_rx.borrow().is_some() {
            break;
          }
        }
        command = self.commands.recv() => match command {
          Some(TriggerCommand::RunNow { responder }) => {
            let outcome = self.fire().await;
            match responder {
              Some(responder) => {
                let _ = responder.send(outcome);
              }
              None => log_outcome(&job_name, outcome),
            }
          }
          Some(TriggerCommand::UpdateSchedule { schedule, responder }) => {
            debug!(job_name = %job_name, ?schedule, "Schedule updated.");
            self.schedule = schedule;
            next_run = self.schedule.calculate_next_run(Utc::now());
            let _ = responder.send(());
          }
          None => break,
        },
        _ = sleep_until_due(wait) => {
          let outcome = self.fire().await;
          log_outcome(&job_name, outcome);
          next_run = self.schedule.calculate_next_run(Utc::now());
          if next_run.is_none() {
            debug!(job_name = %job_name, "Schedule exhausted, waiting for explicit triggers.");
          }
        }
      }
    }
    debug!(job_name = %job_name, "Trigger loop stopped.");
  }

  async fn fire(&self) -> Result<(), CycleError> {
    if let Err(e) = self.sharding.reconcile().await {
      warn!(job_name = %self.orchestrator.job_name, error = %e, "Assignment reconciliation failed.");
    }
    self.orchestrator.run_cycle().await
  }
}

async fn sleep_until_due(wait: Option<Duration>) {
  match wait {
    Some(wait) => tokio::time::sleep(wait).await,
    None => std::future::pending().await,
  }
}

fn log_outcome(job_name: &str, outcome: Result<(), CycleError>) {
  if let Err(e) = outcome {
    warn!(job_name, error = %e, "Cycle finished with error.");
  }
}
