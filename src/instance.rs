use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::storage::{JobNodePath, JobNodeStorage, SERVERS};

const DELIMITER: &str = "@-@";

/// Identity of one participating process: `{host}@-@{token}`.
///
/// Ordering is plain string ordering, which every allocation strategy relies
/// on to produce the same assignment on every instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
  pub fn new(host: &str, token: &str) -> Self {
    Self(format!("{}{}{}", host, DELIMITER, token))
  }

  /// Creates an identity for `host` with a fresh process-unique token.
  pub fn generate(host: &str) -> Self {
    Self::new(host, &Uuid::new_v4().simple().to_string())
  }

  pub(crate) fn from_raw(raw: &str) -> Self {
    Self(raw.to_string())
  }

  pub fn host(&self) -> &str {
    self.0.split(DELIMITER).next().unwrap_or(&self.0)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for InstanceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Presence of instances under `servers/`.
///
/// An instance is live exactly while its ephemeral node exists.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
  storage: JobNodeStorage,
  local: InstanceId,
}

impl InstanceRegistry {
  pub fn new(storage: JobNodeStorage, local: InstanceId) -> Self {
    Self { storage, local }
  }

  pub fn local(&self) -> &InstanceId {
    &self.local
  }

  pub async fn register(&self) -> StoreResult<()> {
    self
      .storage
      .fill_ephemeral_node(&JobNodePath::server(&self.local), self.local.host())
      .await?;
    info!(job_name = %self.storage.job_name(), instance = %self.local, "Instance registered.");
    Ok(())
  }

  pub async fn deregister(&self) -> StoreResult<()> {
    self
      .storage
      .remove_node_if_existed(&JobNodePath::server(&self.local))
      .await?;
    info!(job_name = %self.storage.job_name(), instance = %self.local, "Instance deregistered.");
    Ok(())
  }

  /// Live instances in their stable sort order.
  pub async fn live_instances(&self) -> StoreResult<Vec<InstanceId>> {
    let mut instances: Vec<InstanceId> = self
      .storage
      .children_keys(SERVERS)
      .await?
      .iter()
      .map(|raw| InstanceId::from_raw(raw))
      .collect();
    instances.sort();
    debug!(job_name = %self.storage.job_name(), count = instances.len(), "Listed live instances.");
    Ok(instances)
  }

  pub async fn is_live(&self, instance: &InstanceId) -> StoreResult<bool> {
    self
      .storage
      .is_node_existed(&JobNodePath::server(instance))
      .await
  }

  pub async fn has_live_instances(&self) -> StoreResult<bool> {
    Ok(!self.storage.children_keys(SERVERS).await?.is_empty())
  }
}
