//! Assignment epochs: when to reshard, who computes, how it is published.

pub mod strategy;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::command::ShutdownMode;
use crate::config::ConfigurationGateway;
use crate::election::LeaderElection;
use crate::error::{ConfigError, CycleError, StoreResult};
use crate::execution::ExecutionTracker;
use crate::instance::{InstanceId, InstanceRegistry};
use crate::metrics::JobMetrics;
use crate::poll::PollSettings;
use crate::storage::{
  ItemNode, JobNodePath, JobNodeStorage, SHARDING, SHARDING_NECESSARY, SHARDING_PROCESSING,
};

use self::strategy::StrategyRegistry;

/// Drives the `STABLE -> NECESSARY -> PROCESSING -> STABLE` cycle of a job.
///
/// `sharding/necessary` is persistent and set by the watch handlers;
/// `sharding/processing` is ephemeral so a leader crashing mid-publish does
/// not wedge every follower. Only the leader ever computes an assignment.
#[derive(Debug, Clone)]
pub struct ShardingCoordinator {
  storage: JobNodeStorage,
  config: ConfigurationGateway,
  instances: InstanceRegistry,
  election: LeaderElection,
  tracker: ExecutionTracker,
  strategies: Arc<StrategyRegistry>,
  poll: PollSettings,
  metrics: JobMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
}

impl ShardingCoordinator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    storage: JobNodeStorage,
    config: ConfigurationGateway,
    instances: InstanceRegistry,
    election: LeaderElection,
    tracker: ExecutionTracker,
    strategies: Arc<StrategyRegistry>,
    poll: PollSettings,
    metrics: JobMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  ) -> Self {
    Self {
      storage,
      config,
      instances,
      election,
      tracker,
      strategies,
      poll,
      metrics,
      shutdown_rx,
    }
  }

  fn is_stopped(&self) -> bool {
    self.shutdown_rx.borrow().is_some()
  }

  /// Moves the job to NECESSARY.
  pub async fn set_resharding_flag(&self) -> StoreResult<()> {
    self.storage.fill_node(SHARDING_NECESSARY, "").await?;
    debug!(job_name = %self.storage.job_name(), "Resharding flagged.");
    Ok(())
  }

  pub async fn is_need_sharding(&self) -> StoreResult<bool> {
    self.storage.is_node_existed(SHARDING_NECESSARY).await
  }

  pub async fn is_processing(&self) -> StoreResult<bool> {
    self.storage.is_node_existed(SHARDING_PROCESSING).await
  }

  /// Returns once the job is STABLE again, publishing a new epoch first if
  /// this instance is the leader. Returns early if the job is stopped or no
  /// instance is live.
  pub async fn reshard_if_necessary(&self) -> Result<(), CycleError> {
    let mut backoff = self.poll.backoff();
    loop {
      if self.is_stopped() {
        return Ok(());
      }
      let necessary = self.is_need_sharding().await?;
      let processing = self.is_processing().await?;
      if !necessary && !processing {
        return Ok(());
      }
      if !self.instances.has_live_instances().await? {
        return Ok(());
      }
      if necessary && !processing && self.election.is_leader_until_block().await? {
        return self.reshard_as_leader().await;
      }
      debug!(job_name = %self.storage.job_name(), necessary, processing, "Waiting for resharding to finish.");
      backoff.wait().await;
    }
  }

  async fn reshard_as_leader(&self) -> Result<(), CycleError> {
    let mut backoff = self.poll.backoff();
    while self.tracker.has_any_running_items().await? {
      if self.is_stopped() {
        return Ok(());
      }
      debug!(job_name = %self.storage.job_name(), "Items still running, deferring resharding.");
      backoff.wait().await;
    }

    self.storage.fill_ephemeral_node(SHARDING_PROCESSING, "").await?;
    match self.publish_epoch().await {
      Ok(instances) => {
        self.metrics.reshards_published.fetch_add(1, Ordering::Relaxed);
        if self.instances.live_instances().await? != instances {
          info!(job_name = %self.storage.job_name(), "Instance set changed while resharding, flagging again.");
          self.set_resharding_flag().await?;
        }
        Ok(())
      }
      Err(e) => {
        warn!(job_name = %self.storage.job_name(), error = %e, "Failed to publish assignment.");
        self.storage.remove_node_if_existed(SHARDING_PROCESSING).await?;
        Err(e)
      }
    }
  }

  /// Computes and atomically publishes a fresh assignment, then clears both
  /// flags. PROCESSING is the last node removed. Returns the instance set used.
  async fn publish_epoch(&self) -> Result<Vec<InstanceId>, CycleError> {
    let config = self.config.load(false).await?;
    let strategy = self
      .strategies
      .resolve(&config.sharding_strategy_type)
      .map_err(ConfigError::from)?;
    let instances = self.instances.live_instances().await?;
    let assignment = strategy.allocate(&instances, &config.job_name, config.sharding_total_count);

    let mut txn = self.storage.transaction();
    for (instance, items) in &assignment {
      for &item in items {
        txn = txn.set(&JobNodePath::item(item, ItemNode::Instance), instance.as_str());
      }
    }
    let mut stale = Vec::new();
    for item in self.storage.sharding_item_keys().await? {
      if item < config.sharding_total_count {
        continue;
      }
      let owner_path = JobNodePath::item(item, ItemNode::Instance);
      if self.storage.get_data(&owner_path).await?.is_some() {
        txn = txn.delete(&owner_path);
      }
      stale.push(item);
    }
    txn
      .delete(SHARDING_NECESSARY)
      .delete(SHARDING_PROCESSING)
      .commit()
      .await?;

    // Leftover flags of items beyond the total no longer mean anything.
    for item in stale {
      self
        .storage
        .remove_node_if_existed(&format!("{}/{}", SHARDING, item))
        .await?;
    }
    info!(
      job_name = %self.storage.job_name(),
      total = config.sharding_total_count,
      instances = instances.len(),
      strategy = %config.sharding_strategy_type,
      "Published new sharding assignment."
    );
    Ok(instances)
  }

  /// Items of the published epoch owned by this instance.
  pub async fn get_local_items(&self) -> Result<Vec<u32>, CycleError> {
    let local = self.instances.local().clone();
    Ok(
      self
        .get_assignment()
        .await?
        .into_iter()
        .filter_map(|(item, owner)| (owner == local).then_some(item))
        .collect(),
    )
  }

  /// The published item → owner map, restricted to `[0, sharding_total_count)`.
  pub async fn get_assignment(&self) -> Result<BTreeMap<u32, InstanceId>, CycleError> {
    let total = self.config.load(true).await?.sharding_total_count;
    let mut assignment = BTreeMap::new();
    for item in 0..total {
      if let Some(raw) = self
        .storage
        .get_data(&JobNodePath::item(item, ItemNode::Instance))
        .await?
      {
        assignment.insert(item, InstanceId::from_raw(&raw));
      }
    }
    Ok(assignment)
  }

  /// Leader-only repair: flags resharding when some item has no live owner.
  ///
  /// Returns whether the flag was set.
  pub async fn reconcile(&self) -> Result<bool, CycleError> {
    if !self.election.is_leader().await? || self.is_need_sharding().await? {
      return Ok(false);
    }
    let total = self.config.load(true).await?.sharding_total_count;
    let assignment = self.get_assignment().await?;
    for item in 0..total {
      let healthy = match assignment.get(&item) {
        Some(owner) => self.instances.is_live(owner).await?,
        None => false,
      };
      if !healthy {
        warn!(job_name = %self.storage.job_name(), item, "Item has no live owner, flagging resharding.");
        self.set_resharding_flag().await?;
        return Ok(true);
      }
    }
    Ok(false)
  }
}
