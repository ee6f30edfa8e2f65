//! Leader election over the store's mutual exclusion latch.

use tracing::{debug, info};

use crate::error::StoreResult;
use crate::instance::InstanceRegistry;
use crate::poll::PollSettings;
use crate::storage::{JobNodeStorage, LEADER_INSTANCE, LEADER_LATCH};

/// Elects and answers questions about the job's single leader.
///
/// The leader marker is ephemeral: a crashed leader's marker disappears with
/// its session, and the election watch handler calls [`LeaderElection::elect`]
/// again on every instance. The latch serializes those attempts so only the
/// first one finds the marker absent.
#[derive(Debug, Clone)]
pub struct LeaderElection {
  storage: JobNodeStorage,
  instances: InstanceRegistry,
  poll: PollSettings,
}

impl LeaderElection {
  pub fn new(storage: JobNodeStorage, instances: InstanceRegistry, poll: PollSettings) -> Self {
    Self {
      storage,
      instances,
      poll,
    }
  }

  /// Takes the latch and, if nobody leads, publishes this instance as leader.
  ///
  /// Returns whether this instance is the leader afterwards.
  pub async fn elect(&self) -> StoreResult<bool> {
    self.storage.acquire_latch(LEADER_LATCH).await?;
    let outcome = self.elect_under_latch().await;
    self.storage.release_latch(LEADER_LATCH).await?;
    let elected = outcome?;
    if elected {
      info!(job_name = %self.storage.job_name(), instance = %self.instances.local(), "Elected as leader.");
    }
    Ok(elected)
  }

  async fn elect_under_latch(&self) -> StoreResult<bool> {
    if !self.has_leader().await? {
      self
        .storage
        .fill_ephemeral_node(LEADER_INSTANCE, self.instances.local().as_str())
        .await?;
    }
    self.is_leader().await
  }

  pub async fn is_leader(&self) -> StoreResult<bool> {
    Ok(
      self.storage.get_data(LEADER_INSTANCE).await?.as_deref()
        == Some(self.instances.local().as_str()),
    )
  }

  pub async fn has_leader(&self) -> StoreResult<bool> {
    self.storage.is_node_existed(LEADER_INSTANCE).await
  }

  /// Waits until some instance leads, electing when this instance is live,
  /// then reports whether it is this one.
  pub async fn is_leader_until_block(&self) -> StoreResult<bool> {
    let mut backoff = self.poll.backoff();
    while !self.has_leader().await? && self.instances.has_live_instances().await? {
      debug!(job_name = %self.storage.job_name(), "Leader is electing, waiting.");
      backoff.wait().await;
      if self.instances.is_live(self.instances.local()).await? {
        self.elect().await?;
      }
    }
    self.is_leader().await
  }

  /// Gives up leadership if held, so another instance can be elected.
  pub async fn resign(&self) -> StoreResult<()> {
    if self.is_leader().await? {
      self.storage.remove_node_if_existed(LEADER_INSTANCE).await?;
      info!(job_name = %self.storage.job_name(), instance = %self.instances.local(), "Resigned leadership.");
    }
    Ok(())
  }
}
