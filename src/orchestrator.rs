//! One trigger of one job on this instance, start to finish.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::command::{ShutdownMode, TriggerCommand};
use crate::config::{ConfigurationGateway, JobConfiguration};
use crate::error::{CycleError, JobError};
use crate::execution::ExecutionTracker;
use crate::failover::FailoverQueue;
use crate::handler::JobErrorHandler;
use crate::instance::InstanceRegistry;
use crate::job::{BoxedItemFn, ItemResult, JobListener, ShardingContext, ShardingContexts};
use crate::metrics::JobMetrics;
use crate::sharding::ShardingCoordinator;

#[cfg(feature = "job_context")]
use crate::job::context::CURRENT_SHARDING_CONTEXT;

#[derive(Debug, Clone, Copy)]
enum ListenerPhase {
  Before,
  After,
}

/// Runs the fixed sequence of one cycle:
///
/// 1. clock drift check, 2. reshard if flagged, 3. pick executable items,
/// 4. skip if none, 5. skip on misfire, 6. before-listeners, 7. execute,
/// 8. misfire catch-up, 9. failover, 10. after-listeners.
///
/// Item and listener errors go to the error handler; completion bookkeeping
/// runs whatever the items did.
#[derive(Clone)]
pub(crate) struct CycleOrchestrator {
  pub config: ConfigurationGateway,
  pub sharding: ShardingCoordinator,
  pub tracker: ExecutionTracker,
  pub failover: FailoverQueue,
  pub instances: InstanceRegistry,
  pub error_handler: Arc<dyn JobErrorHandler>,
  pub item_fn: Arc<BoxedItemFn>,
  pub listeners: Arc<Vec<Arc<dyn JobListener>>>,
  pub workers: Arc<Semaphore>,
  pub metrics: JobMetrics,
  pub shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  pub trigger_tx: mpsc::Sender<TriggerCommand>,
  pub job_name: String,
}

impl CycleOrchestrator {
  fn is_stopped(&self) -> bool {
    self.shutdown_rx.borrow().is_some()
  }

  pub async fn run_cycle(&self) -> Result<(), CycleError> {
    let span = tracing::info_span!(
      "job_cycle",
      job_name = self.job_name.as_str(),
      instance = %self.instances.local(),
    );
    self.run_cycle_inner().instrument(span).await
  }

  async fn run_cycle_inner(&self) -> Result<(), CycleError> {
    self.metrics.cycles_triggered.fetch_add(1, Ordering::Relaxed);

    if let Err(e) = self.config.check_max_time_diff().await {
      self.metrics.cycles_aborted.fetch_add(1, Ordering::Relaxed);
      error!(error = %e, "Environment check failed, cycle aborted.");
      let aborted = JobError::CycleAborted {
        job_name: self.job_name.clone(),
        message: e.to_string(),
      };
      // The cycle fails either way; a propagating handler adds nothing.
      let _ = self.error_handler.handle_error(&self.job_name, &aborted);
      return Err(e);
    }

    if let Err(e) = self.sharding.reshard_if_necessary().await {
      self.metrics.cycles_aborted.fetch_add(1, Ordering::Relaxed);
      return Err(e);
    }

    let config = self.config.load(true).await?;
    let items = self.executable_items(&config).await?;
    if items.is_empty() {
      self.metrics.cycles_skipped_empty.fetch_add(1, Ordering::Relaxed);
      trace!("No executable items on this instance.");
      return Ok(());
    }

    if self.tracker.misfire_if_running(&items).await? {
      self.metrics.misfires_recorded.fetch_add(1, Ordering::Relaxed);
      debug!(?items, "Previous run still in progress, trigger skipped.");
      return Ok(());
    }

    let contexts = ShardingContexts::new(&config, &items);
    let mut propagated = Vec::new();
    self.notify_listeners(ListenerPhase::Before, &contexts, &mut propagated);

    self.execute(&config, &contexts, &mut propagated).await?;

    while config.misfire && !self.is_stopped() {
      let flagged = self.tracker.get_misfired_items(&items).await?;
      if flagged.is_empty() || self.sharding.is_need_sharding().await? {
        break;
      }
      self.tracker.clear_misfire(&flagged).await?;
      self
        .metrics
        .misfire_catch_ups
        .fetch_add(flagged.len(), Ordering::Relaxed);
      debug!(items = ?flagged, "Running misfired items.");
      self
        .execute(&config, &contexts.restrict_to(&flagged), &mut propagated)
        .await?;
    }

    if config.is_failover_enabled() && !self.is_stopped() {
      let claimed = self.failover.failover_if_necessary().await?;
      if !claimed.is_empty() && self.trigger_tx.try_send(TriggerCommand::RunNow { responder: None }).is_err() {
        debug!("Follow-up cycle already pending.");
      }
    }

    self.notify_listeners(ListenerPhase::After, &contexts, &mut propagated);

    if propagated.is_empty() {
      Ok(())
    } else {
      Err(CycleError::Propagated(propagated))
    }
  }

  /// Claimed failover items if any, else the local assignment minus items
  /// other instances took over; disabled items are never executed.
  async fn executable_items(&self, config: &JobConfiguration) -> Result<Vec<u32>, CycleError> {
    let mut items = Vec::new();
    if config.is_failover_enabled() {
      items = self.failover.get_local_failover_items().await?;
      if !items.is_empty() {
        info!(?items, "Executing failover items.");
      }
    }
    if items.is_empty() {
      items = self.sharding.get_local_items().await?;
      if config.is_failover_enabled() {
        let taken_over = self.failover.get_taken_over_items().await?;
        items.retain(|item| !taken_over.contains(item));
      }
    }
    items.retain(|item| *item < config.sharding_total_count);
    let disabled = self.tracker.get_disabled_items(&items).await?;
    items.retain(|item| !disabled.contains(item));
    Ok(items)
  }

  /// Step 7: mark running, run every item, always mark completed.
  async fn execute(
    &self,
    config: &JobConfiguration,
    contexts: &ShardingContexts,
    propagated: &mut Vec<JobError>,
  ) -> Result<(), CycleError> {
    let items = contexts.item_numbers();
    if let Err(e) = self.tracker.register_begin(&items).await {
      let _ = self.tracker.register_completed(&items).await;
      return Err(e);
    }

    let outcomes = self.run_items(contexts).await;

    let completed = self.tracker.register_completed(&items).await;
    let released = if config.is_failover_enabled() {
      self.failover.update_failover_complete(&items).await
    } else {
      Ok(())
    };

    for (item, outcome) in outcomes {
      let failure = match outcome {
        ItemOutcome::Succeeded => {
          self.metrics.items_succeeded.fetch_add(1, Ordering::Relaxed);
          continue;
        }
        ItemOutcome::Failed(message) => {
          self.metrics.items_failed.fetch_add(1, Ordering::Relaxed);
          JobError::ItemFailed {
            job_name: self.job_name.clone(),
            item,
            message,
          }
        }
        ItemOutcome::Panicked => {
          self.metrics.items_panicked.fetch_add(1, Ordering::Relaxed);
          JobError::ItemPanicked {
            job_name: self.job_name.clone(),
            item,
          }
        }
      };
      if let Err(e) = self.error_handler.handle_error(&self.job_name, &failure) {
        propagated.push(e);
      }
    }

    completed?;
    released?;
    Ok(())
  }

  /// One item runs inline; several go through the worker pool.
  async fn run_items(&self, contexts: &ShardingContexts) -> Vec<(u32, ItemOutcome)> {
    let items = contexts.item_numbers();
    if let [item] = items.as_slice() {
      let item = *item;
      let started = Instant::now();
      let result = AssertUnwindSafe(run_item(self.item_fn.clone(), contexts.for_item(item)))
        .catch_unwind()
        .await;
      self.metrics.item_execution_duration.record(started.elapsed());
      let outcome = match result {
        Ok(result) => ItemOutcome::from(result),
        Err(_) => {
          error!(item, "Item panicked.");
          ItemOutcome::Panicked
        }
      };
      return vec![(item, outcome)];
    }

    let handles = items.iter().map(|&item| {
      let item_fn = self.item_fn.clone();
      let workers = self.workers.clone();
      let context = contexts.for_item(item);
      tokio::spawn(
        async move {
          let Ok(_permit) = workers.acquire_owned().await else {
            return (Err("worker pool closed".to_string()), Duration::ZERO);
          };
          let started = Instant::now();
          let result = run_item(item_fn, context).await;
          (result, started.elapsed())
        }
        .in_current_span(),
      )
    });
    let joined = join_all(handles).await;

    items
      .into_iter()
      .zip(joined)
      .map(|(item, joined)| {
        let outcome = match joined {
          Ok((result, elapsed)) => {
            self.metrics.item_execution_duration.record(elapsed);
            ItemOutcome::from(result)
          }
          Err(join_error) if join_error.is_panic() => {
            error!(item, "Item panicked.");
            ItemOutcome::Panicked
          }
          Err(_) => {
            warn!(item, "Item task was cancelled.");
            ItemOutcome::Failed("cancelled".to_string())
          }
        };
        (item, outcome)
      })
      .collect()
  }

  fn notify_listeners(&self, phase: ListenerPhase, contexts: &ShardingContexts, propagated: &mut Vec<JobError>) {
    for listener in self.listeners.iter() {
      let called = std::panic::catch_unwind(AssertUnwindSafe(|| match phase {
        ListenerPhase::Before => listener.before_job_executed(contexts),
        ListenerPhase::After => listener.after_job_executed(contexts),
      }));
      let message = match called {
        Ok(Ok(())) => continue,
        Ok(Err(message)) => message,
        Err(_) => "listener panicked".to_string(),
      };
      self.metrics.listener_errors.fetch_add(1, Ordering::Relaxed);
      let failure = JobError::ListenerFailed {
        job_name: self.job_name.clone(),
        listener: listener.name().to_string(),
        message,
      };
      warn!(?phase, error = %failure, "Listener failed.");
      if let Err(e) = self.error_handler.handle_error(&self.job_name, &failure) {
        propagated.push(e);
      }
    }
  }
}

#[derive(Debug)]
enum ItemOutcome {
  Succeeded,
  Failed(String),
  Panicked,
}

impl From<ItemResult> for ItemOutcome {
  fn from(result: ItemResult) -> Self {
    match result {
      Ok(()) => ItemOutcome::Succeeded,
      Err(message) => ItemOutcome::Failed(message),
    }
  }
}

async fn run_item(item_fn: Arc<BoxedItemFn>, context: ShardingContext) -> ItemResult {
  #[cfg(feature = "job_context")]
  {
    let future = item_fn(context.clone());
    CURRENT_SHARDING_CONTEXT.scope(context, future).await
  }
  #[cfg(not(feature = "job_context"))]
  {
    item_fn(context).await
  }
}
