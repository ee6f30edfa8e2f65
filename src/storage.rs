//! Per-job node layout and a namespaced view over the coordination store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::StoreResult;
use crate::instance::InstanceId;
use crate::store::{CoordinatorStore, StoreEvent, TxnOp};

pub(crate) const CONFIG: &str = "config";
pub(crate) const LEADER_LATCH: &str = "leader/election/latch";
pub(crate) const LEADER_INSTANCE: &str = "leader/election/instance";
pub(crate) const SERVERS: &str = "servers";
pub(crate) const SHARDING: &str = "sharding";
pub(crate) const SHARDING_NECESSARY: &str = "sharding/necessary";
pub(crate) const SHARDING_PROCESSING: &str = "sharding/processing";
pub(crate) const FAILOVER: &str = "failover";

/// Leaf nodes stored under `sharding/{item}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemNode {
  Instance,
  Running,
  Misfire,
  Disabled,
  Failover,
}

impl ItemNode {
  fn name(self) -> &'static str {
    match self {
      ItemNode::Instance => "instance",
      ItemNode::Running => "running",
      ItemNode::Misfire => "misfire",
      ItemNode::Disabled => "disabled",
      ItemNode::Failover => "failover",
    }
  }

  fn parse(name: &str) -> Option<Self> {
    match name {
      "instance" => Some(ItemNode::Instance),
      "running" => Some(ItemNode::Running),
      "misfire" => Some(ItemNode::Misfire),
      "disabled" => Some(ItemNode::Disabled),
      "failover" => Some(ItemNode::Failover),
      _ => None,
    }
  }
}

/// Builds and parses the logical paths of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNodePath {
  job_name: String,
}

impl JobNodePath {
  pub fn new(job_name: &str) -> Self {
    Self {
      job_name: job_name.to_string(),
    }
  }

  pub fn job_name(&self) -> &str {
    &self.job_name
  }

  /// Absolute path of the job's root node.
  pub fn root(&self) -> String {
    format!("/{}", self.job_name)
  }

  /// Absolute path for a node relative to the job root.
  pub fn full(&self, relative: &str) -> String {
    format!("/{}/{}", self.job_name, relative)
  }

  /// Strips the job root from an absolute path.
  pub fn relative<'a>(&self, full: &'a str) -> Option<&'a str> {
    full
      .strip_prefix('/')?
      .strip_prefix(self.job_name.as_str())?
      .strip_prefix('/')
  }

  pub fn server(id: &InstanceId) -> String {
    format!("{}/{}", SERVERS, id)
  }

  pub(crate) fn item(item: u32, node: ItemNode) -> String {
    format!("{}/{}/{}", SHARDING, item, node.name())
  }

  pub fn failover_entry(item: u32) -> String {
    format!("{}/{}", FAILOVER, item)
  }

  /// Parses `sharding/{item}/{leaf}` into its parts.
  pub(crate) fn parse_item(relative: &str) -> Option<(u32, ItemNode)> {
    let rest = relative.strip_prefix(SHARDING)?.strip_prefix('/')?;
    let (item, leaf) = rest.split_once('/')?;
    Some((item.parse().ok()?, ItemNode::parse(leaf)?))
  }

  /// Parses `servers/{instance}` into the instance id.
  pub(crate) fn parse_server(relative: &str) -> Option<InstanceId> {
    let id = relative.strip_prefix(SERVERS)?.strip_prefix('/')?;
    if id.is_empty() || id.contains('/') {
      return None;
    }
    Some(InstanceId::from_raw(id))
  }
}

/// The coordination store seen through one job's namespace.
///
/// All paths passed in are relative to the job root.
#[derive(Debug, Clone)]
pub struct JobNodeStorage {
  store: Arc<dyn CoordinatorStore>,
  path: JobNodePath,
}

impl JobNodeStorage {
  pub fn new(store: Arc<dyn CoordinatorStore>, job_name: &str) -> Self {
    Self {
      store,
      path: JobNodePath::new(job_name),
    }
  }

  pub fn job_name(&self) -> &str {
    self.path.job_name()
  }

  pub fn node_path(&self) -> &JobNodePath {
    &self.path
  }

  pub fn store(&self) -> &Arc<dyn CoordinatorStore> {
    &self.store
  }

  pub async fn is_node_existed(&self, relative: &str) -> StoreResult<bool> {
    self.store.exists(&self.path.full(relative)).await
  }

  pub async fn get_data(&self, relative: &str) -> StoreResult<Option<String>> {
    self.store.read(&self.path.full(relative)).await
  }

  pub async fn fill_node(&self, relative: &str, value: &str) -> StoreResult<()> {
    self.store.persist(&self.path.full(relative), value).await
  }

  pub async fn fill_ephemeral_node(&self, relative: &str, value: &str) -> StoreResult<()> {
    self
      .store
      .persist_ephemeral(&self.path.full(relative), value)
      .await
  }

  pub async fn remove_node_if_existed(&self, relative: &str) -> StoreResult<()> {
    self.store.remove(&self.path.full(relative)).await
  }

  pub async fn children_keys(&self, relative: &str) -> StoreResult<Vec<String>> {
    self.store.children(&self.path.full(relative)).await
  }

  /// Numeric children of `sharding/`, sorted ascending.
  pub async fn sharding_item_keys(&self) -> StoreResult<Vec<u32>> {
    let mut items: Vec<u32> = self
      .children_keys(SHARDING)
      .await?
      .iter()
      .filter_map(|key| key.parse().ok())
      .collect();
    items.sort_unstable();
    Ok(items)
  }

  /// Starts an atomic batch whose operations take relative paths.
  pub fn transaction(&self) -> JobTransaction<'_> {
    JobTransaction {
      storage: self,
      ops: Vec::new(),
    }
  }

  pub fn subscribe(&self) -> StoreResult<mpsc::UnboundedReceiver<StoreEvent>> {
    self.store.subscribe(&self.path.root())
  }

  pub async fn acquire_latch(&self, relative: &str) -> StoreResult<()> {
    self.store.acquire_latch(&self.path.full(relative)).await
  }

  pub async fn release_latch(&self, relative: &str) -> StoreResult<()> {
    self.store.release_latch(&self.path.full(relative)).await
  }

  pub async fn registry_center_time(&self) -> StoreResult<DateTime<Utc>> {
    self.store.server_time().await
  }
}

/// Builder for an atomic batch over one job's namespace.
#[derive(Debug)]
pub struct JobTransaction<'a> {
  storage: &'a JobNodeStorage,
  ops: Vec<TxnOp>,
}

impl JobTransaction<'_> {
  pub fn create(mut self, relative: &str, value: &str, ephemeral: bool) -> Self {
    self.ops.push(TxnOp::Create {
      path: self.storage.path.full(relative),
      value: value.to_string(),
      ephemeral,
    });
    self
  }

  pub fn set(mut self, relative: &str, value: &str) -> Self {
    self.ops.push(TxnOp::Set {
      path: self.storage.path.full(relative),
      value: value.to_string(),
    });
    self
  }

  pub fn delete(mut self, relative: &str) -> Self {
    self.ops.push(TxnOp::Delete {
      path: self.storage.path.full(relative),
    });
    self
  }

  pub fn check_exists(mut self, relative: &str) -> Self {
    self.ops.push(TxnOp::CheckExists {
      path: self.storage.path.full(relative),
    });
    self
  }

  pub async fn commit(self) -> StoreResult<()> {
    self.storage.store.commit(self.ops).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_item_and_server_paths() {
    let path = JobNodePath::new("billing");
    let full = path.full(&JobNodePath::item(7, ItemNode::Running));
    assert_eq!(full, "/billing/sharding/7/running");

    let rel = path.relative(&full).unwrap();
    assert_eq!(JobNodePath::parse_item(rel), Some((7, ItemNode::Running)));
    assert_eq!(JobNodePath::parse_item(SHARDING_NECESSARY), None);
    assert_eq!(path.relative("/billing-v2/sharding/7/running"), None);

    let server = JobNodePath::parse_server("servers/10.0.0.1@-@abc").unwrap();
    assert_eq!(server.as_str(), "10.0.0.1@-@abc");
    assert!(JobNodePath::parse_server("servers").is_none());
  }
}
