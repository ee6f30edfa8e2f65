//! Queue of orphaned sharding items awaiting another instance.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::config::ConfigurationGateway;
use crate::error::{CycleError, StoreError, StoreResult};
use crate::execution::ExecutionTracker;
use crate::instance::{InstanceId, InstanceRegistry};
use crate::metrics::JobMetrics;
use crate::storage::{ItemNode, JobNodePath, JobNodeStorage, FAILOVER};

pub const DEFAULT_FAILOVER_CAPACITY: usize = 1024;

/// Failover entries live at `failover/{item}`; a claim is recorded at
/// `sharding/{item}/failover` with the claimant's id.
///
/// Claiming is one atomic batch that deletes the entry and writes the claim,
/// so two instances racing for the same entry cannot both win.
#[derive(Debug, Clone)]
pub struct FailoverQueue {
  storage: JobNodeStorage,
  config: ConfigurationGateway,
  tracker: ExecutionTracker,
  instances: InstanceRegistry,
  capacity: usize,
  metrics: JobMetrics,
}

impl FailoverQueue {
  pub fn new(
    storage: JobNodeStorage,
    config: ConfigurationGateway,
    tracker: ExecutionTracker,
    instances: InstanceRegistry,
    capacity: usize,
    metrics: JobMetrics,
  ) -> Self {
    Self {
      storage,
      config,
      tracker,
      instances,
      capacity,
      metrics,
    }
  }

  async fn queued_items(&self) -> StoreResult<BTreeSet<u32>> {
    Ok(
      self
        .storage
        .children_keys(FAILOVER)
        .await?
        .iter()
        .filter_map(|key| key.parse().ok())
        .collect(),
    )
  }

  /// Queues `item` for failover. `origin` records the instance that lost it.
  ///
  /// Returns `false` when the entry was dropped: the queue is full, or the
  /// item is already queued, running on a live instance or claimed by one.
  pub async fn add(&self, item: u32, origin: &InstanceId) -> StoreResult<bool> {
    let queued = self.queued_items().await?;
    if queued.len() >= self.capacity {
      self.metrics.failover_dropped.fetch_add(1, Ordering::Relaxed);
      warn!(
        job_name = %self.storage.job_name(), item, capacity = self.capacity,
        "Failover queue is full, dropping entry."
      );
      return Ok(false);
    }
    if queued.contains(&item) || self.tracker.is_running(item).await? || self.is_claimed_by_live(item).await? {
      debug!(job_name = %self.storage.job_name(), item, "Skipping failover entry for queued, running or claimed item.");
      return Ok(false);
    }
    let created = self
      .storage
      .transaction()
      .create(&JobNodePath::failover_entry(item), origin.as_str(), false)
      .commit()
      .await;
    match created {
      Ok(()) => {
        self.metrics.failover_enqueued.fetch_add(1, Ordering::Relaxed);
        info!(job_name = %self.storage.job_name(), item, origin = %origin, "Item queued for failover.");
        Ok(true)
      }
      Err(StoreError::TransactionFailed { .. }) => Ok(false),
      Err(e) => Err(e),
    }
  }

  // The claim is written in the same batch that deletes the entry, so a
  // reader that no longer sees the entry always sees the claim.
  async fn is_claimed_by_live(&self, item: u32) -> StoreResult<bool> {
    match self
      .storage
      .get_data(&JobNodePath::item(item, ItemNode::Failover))
      .await?
    {
      Some(claimant) => self.instances.is_live(&InstanceId::from_raw(&claimant)).await,
      None => Ok(false),
    }
  }

  /// Queues every item the crashed instance was running or had claimed.
  pub async fn enqueue_crashed(&self, crashed: &InstanceId) -> StoreResult<usize> {
    let mut items: BTreeSet<u32> = self.tracker.items_running_on(crashed).await?.into_iter().collect();
    for item in self.storage.sharding_item_keys().await? {
      let claim = self
        .storage
        .get_data(&JobNodePath::item(item, ItemNode::Failover))
        .await?;
      if claim.as_deref() == Some(crashed.as_str()) {
        items.insert(item);
      }
    }
    let mut added = 0;
    for item in items {
      if self.add(item, crashed).await? {
        added += 1;
      }
    }
    Ok(added)
  }

  /// Queues items whose running marker names a dead instance.
  pub async fn enqueue_orphans(&self) -> Result<usize, CycleError> {
    let mut added = 0;
    for item in self.tracker.orphaned_items().await? {
      if let Some(owner) = self.tracker.running_owner(item).await? {
        if self.add(item, &owner).await? {
          added += 1;
        }
      }
    }
    Ok(added)
  }

  /// Claims every queued item not confirmed running elsewhere.
  ///
  /// Entries for items that are running again are stale and get removed.
  /// A lost claim race is skipped rather than retried, and an instance no
  /// longer registered under `servers/` cannot claim at all.
  pub async fn claim_eligible(&self) -> StoreResult<Vec<u32>> {
    let local = self.instances.local();
    let mut claimed = Vec::new();
    for item in self.queued_items().await? {
      if self.tracker.is_running(item).await? {
        debug!(job_name = %self.storage.job_name(), item, "Dropping stale failover entry for running item.");
        self.storage.remove_node_if_existed(&JobNodePath::failover_entry(item)).await?;
        continue;
      }
      let won = self
        .storage
        .transaction()
        .check_exists(&JobNodePath::server(local))
        .delete(&JobNodePath::failover_entry(item))
        .set(&JobNodePath::item(item, ItemNode::Failover), local.as_str())
        .commit()
        .await;
      match won {
        Ok(()) => {
          // The orphan marker is released once the claim is recorded.
          if let Some(owner) = self.tracker.running_owner(item).await? {
            if &owner != local && !self.instances.is_live(&owner).await? {
              self
                .storage
                .remove_node_if_existed(&JobNodePath::item(item, ItemNode::Running))
                .await?;
            }
          }
          claimed.push(item);
        }
        Err(StoreError::TransactionFailed { .. }) => {
          debug!(job_name = %self.storage.job_name(), item, "Failover entry claimed elsewhere.");
        }
        Err(e) => return Err(e),
      }
    }
    if !claimed.is_empty() {
      self
        .metrics
        .failover_claimed
        .fetch_add(claimed.len(), Ordering::Relaxed);
      info!(job_name = %self.storage.job_name(), instance = %local, items = ?claimed, "Claimed failover items.");
    }
    Ok(claimed)
  }

  /// Detects orphans and, unless this process is busy, claims what it can.
  pub async fn failover_if_necessary(&self) -> Result<Vec<u32>, CycleError> {
    if !self.config.is_failover_enabled().await? {
      return Ok(Vec::new());
    }
    self.enqueue_orphans().await?;
    if self.tracker.is_job_running() {
      return Ok(Vec::new());
    }
    Ok(self.claim_eligible().await?)
  }

  /// Items claimed by this instance.
  pub async fn get_local_failover_items(&self) -> StoreResult<Vec<u32>> {
    self.claimed_items(|claimant| claimant == self.instances.local()).await
  }

  /// Items claimed by some other instance.
  pub async fn get_taken_over_items(&self) -> StoreResult<Vec<u32>> {
    self.claimed_items(|claimant| claimant != self.instances.local()).await
  }

  async fn claimed_items(&self, accept: impl Fn(&InstanceId) -> bool) -> StoreResult<Vec<u32>> {
    let mut items = Vec::new();
    for item in self.storage.sharding_item_keys().await? {
      if let Some(raw) = self
        .storage
        .get_data(&JobNodePath::item(item, ItemNode::Failover))
        .await?
      {
        if accept(&InstanceId::from_raw(&raw)) {
          items.push(item);
        }
      }
    }
    Ok(items)
  }

  /// Drops this instance's claims and any stale entries once `items` completed.
  pub async fn update_failover_complete(&self, items: &[u32]) -> StoreResult<()> {
    for &item in items {
      let claim_path = JobNodePath::item(item, ItemNode::Failover);
      if self.storage.get_data(&claim_path).await?.as_deref() == Some(self.instances.local().as_str()) {
        self.storage.remove_node_if_existed(&claim_path).await?;
      }
    }
    self.remove(items).await
  }

  pub async fn remove(&self, items: &[u32]) -> StoreResult<()> {
    for &item in items {
      self
        .storage
        .remove_node_if_existed(&JobNodePath::failover_entry(item))
        .await?;
    }
    Ok(())
  }
}
