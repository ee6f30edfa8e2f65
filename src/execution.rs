//! Running markers, misfire flags and disabled items.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::ConfigurationGateway;
use crate::error::{CycleError, StoreResult};
use crate::instance::{InstanceId, InstanceRegistry};
use crate::storage::{ItemNode, JobNodePath, JobNodeStorage};

/// Tracks which sharding items are executing, which missed a trigger and
/// which are administratively disabled.
///
/// A running marker is persistent when failover is enabled, so it survives
/// its owner's crash and can be detected as orphaned; otherwise it is
/// ephemeral and vanishes with the owner's session. Markers are only written
/// while `monitor_execution` is on. Local execution state is always kept.
#[derive(Debug, Clone)]
pub struct ExecutionTracker {
  storage: JobNodeStorage,
  config: ConfigurationGateway,
  instances: InstanceRegistry,
  local_running: Arc<Mutex<BTreeSet<u32>>>,
}

impl ExecutionTracker {
  pub fn new(storage: JobNodeStorage, config: ConfigurationGateway, instances: InstanceRegistry) -> Self {
    Self {
      storage,
      config,
      instances,
      local_running: Arc::new(Mutex::new(BTreeSet::new())),
    }
  }

  pub async fn register_begin(&self, items: &[u32]) -> Result<(), CycleError> {
    self.local_running.lock().extend(items.iter().copied());
    let config = self.config.load(true).await?;
    if !config.monitor_execution {
      return Ok(());
    }
    let local = self.instances.local().as_str();
    for &item in items {
      let path = JobNodePath::item(item, ItemNode::Running);
      if config.is_failover_enabled() {
        self.storage.fill_node(&path, local).await?;
      } else {
        self.storage.fill_ephemeral_node(&path, local).await?;
      }
    }
    debug!(job_name = %self.storage.job_name(), ?items, "Registered items as running.");
    Ok(())
  }

  /// Removes this instance's running markers for `items`.
  ///
  /// A marker that another instance has since taken over is left alone.
  pub async fn register_completed(&self, items: &[u32]) -> Result<(), CycleError> {
    {
      let mut running = self.local_running.lock();
      for item in items {
        running.remove(item);
      }
    }
    let config = self.config.load(true).await?;
    if !config.monitor_execution {
      return Ok(());
    }
    for &item in items {
      let path = JobNodePath::item(item, ItemNode::Running);
      if self.storage.get_data(&path).await?.as_deref() == Some(self.instances.local().as_str()) {
        self.storage.remove_node_if_existed(&path).await?;
      }
    }
    debug!(job_name = %self.storage.job_name(), ?items, "Registered items as completed.");
    Ok(())
  }

  /// True while this process executes any item of the job.
  pub fn is_job_running(&self) -> bool {
    !self.local_running.lock().is_empty()
  }

  pub async fn running_owner(&self, item: u32) -> StoreResult<Option<InstanceId>> {
    Ok(
      self
        .storage
        .get_data(&JobNodePath::item(item, ItemNode::Running))
        .await?
        .map(|raw| InstanceId::from_raw(&raw)),
    )
  }

  /// True if `item` carries a marker owned by another live instance, or is
  /// executing in this process.
  ///
  /// Markers left behind by dead instances are orphans, not running items.
  /// A marker naming this instance for an item this process is not executing
  /// is stale (a restart under the same id, or a failed completion) and is
  /// removed.
  pub async fn is_running(&self, item: u32) -> StoreResult<bool> {
    match self.running_owner(item).await? {
      Some(owner) if &owner == self.instances.local() => {
        if self.local_running.lock().contains(&item) {
          return Ok(true);
        }
        self.release_stale_marker(item).await?;
        Ok(false)
      }
      Some(owner) => self.instances.is_live(&owner).await,
      None => Ok(false),
    }
  }

  /// Removes every marker naming this instance for items this process is not
  /// executing. Returns the released items.
  pub async fn release_stale_markers(&self) -> StoreResult<Vec<u32>> {
    let mut released = Vec::new();
    for item in self.items_running_on(self.instances.local()).await? {
      if !self.local_running.lock().contains(&item) {
        self.release_stale_marker(item).await?;
        released.push(item);
      }
    }
    Ok(released)
  }

  async fn release_stale_marker(&self, item: u32) -> StoreResult<()> {
    self
      .storage
      .remove_node_if_existed(&JobNodePath::item(item, ItemNode::Running))
      .await?;
    warn!(job_name = %self.storage.job_name(), item, "Released stale running marker of this instance.");
    Ok(())
  }

  pub async fn has_running_items(&self, items: &[u32]) -> Result<bool, CycleError> {
    if !self.config.load(true).await?.monitor_execution {
      return Ok(false);
    }
    for &item in items {
      if self.is_running(item).await? {
        return Ok(true);
      }
    }
    Ok(false)
  }

  /// Running check over every item of the job.
  pub async fn has_any_running_items(&self) -> Result<bool, CycleError> {
    let total = self.config.load(true).await?.sharding_total_count;
    let items: Vec<u32> = (0..total).collect();
    self.has_running_items(&items).await
  }

  /// Items whose persistent marker names an instance that is no longer live.
  pub async fn orphaned_items(&self) -> Result<Vec<u32>, CycleError> {
    let mut orphaned = Vec::new();
    for item in self.storage.sharding_item_keys().await? {
      if let Some(owner) = self.running_owner(item).await? {
        if &owner != self.instances.local() && !self.instances.is_live(&owner).await? {
          orphaned.push(item);
        }
      }
    }
    Ok(orphaned)
  }

  /// Items whose running marker names `owner`.
  pub async fn items_running_on(&self, owner: &InstanceId) -> StoreResult<Vec<u32>> {
    let mut items = Vec::new();
    for item in self.storage.sharding_item_keys().await? {
      if self.running_owner(item).await?.as_ref() == Some(owner) {
        items.push(item);
      }
    }
    Ok(items)
  }

  /// Flags every item of `items` that is still running and reports whether any was.
  ///
  /// Without execution monitoring only this process's own running items count.
  /// Flags are only written when the job allows misfire catch-up.
  pub async fn misfire_if_running(&self, items: &[u32]) -> Result<bool, CycleError> {
    let config = self.config.load(true).await?;
    let mut running = Vec::new();
    if config.monitor_execution {
      for &item in items {
        if self.is_running(item).await? {
          running.push(item);
        }
      }
    } else {
      let local = self.local_running.lock();
      running.extend(items.iter().copied().filter(|item| local.contains(item)));
    }
    if running.is_empty() {
      return Ok(false);
    }
    if config.misfire {
      self.set_misfire(&running).await?;
    }
    debug!(job_name = %self.storage.job_name(), items = ?running, "Trigger misfired on running items.");
    Ok(true)
  }

  pub async fn set_misfire(&self, items: &[u32]) -> StoreResult<()> {
    for &item in items {
      self
        .storage
        .fill_node(&JobNodePath::item(item, ItemNode::Misfire), "")
        .await?;
    }
    Ok(())
  }

  pub async fn get_misfired_items(&self, items: &[u32]) -> StoreResult<Vec<u32>> {
    self.filter_flagged(items, ItemNode::Misfire).await
  }

  pub async fn clear_misfire(&self, items: &[u32]) -> StoreResult<()> {
    for &item in items {
      self
        .storage
        .remove_node_if_existed(&JobNodePath::item(item, ItemNode::Misfire))
        .await?;
    }
    trace!(job_name = %self.storage.job_name(), ?items, "Cleared misfire flags.");
    Ok(())
  }

  pub async fn get_disabled_items(&self, items: &[u32]) -> StoreResult<Vec<u32>> {
    self.filter_flagged(items, ItemNode::Disabled).await
  }

  pub async fn set_disabled(&self, item: u32, disabled: bool) -> StoreResult<()> {
    let path = JobNodePath::item(item, ItemNode::Disabled);
    if disabled {
      self.storage.fill_node(&path, "").await
    } else {
      self.storage.remove_node_if_existed(&path).await
    }
  }

  async fn filter_flagged(&self, items: &[u32], node: ItemNode) -> StoreResult<Vec<u32>> {
    let mut flagged = Vec::new();
    for &item in items {
      if self
        .storage
        .is_node_existed(&JobNodePath::item(item, node))
        .await?
      {
        flagged.push(item);
      }
    }
    Ok(flagged)
  }
}
