//! Reaction paths for store change notifications.
//!
//! One dispatcher task drains the job's subtree subscription and routes each
//! event to the handler task for its concern: configuration, sharding,
//! election, failover. Handlers never run item bodies; at most they ask the
//! trigger loop for a follow-up cycle.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::command::{ShutdownMode, TriggerCommand};
use crate::config::ConfigurationGateway;
use crate::election::LeaderElection;
use crate::error::{CycleError, StoreResult};
use crate::failover::FailoverQueue;
use crate::instance::{InstanceId, InstanceRegistry};
use crate::poll::PollSettings;
use crate::sharding::ShardingCoordinator;
use crate::storage::{ItemNode, JobNodePath, CONFIG, FAILOVER, LEADER_INSTANCE, SHARDING};
use crate::store::{StoreEvent, StoreEventKind};

#[derive(Debug)]
enum FailoverSignal {
  InstanceCrashed(InstanceId),
  EntryQueued(u32),
}

/// Everything the watch handlers of one job act on.
#[derive(Debug, Clone)]
pub(crate) struct WatchHandlers {
  pub path: JobNodePath,
  pub config: ConfigurationGateway,
  pub sharding: ShardingCoordinator,
  pub election: LeaderElection,
  pub instances: InstanceRegistry,
  pub failover: FailoverQueue,
  pub poll: PollSettings,
  pub trigger_tx: mpsc::Sender<TriggerCommand>,
}

struct Routes {
  config_tx: mpsc::UnboundedSender<String>,
  sharding_tx: mpsc::UnboundedSender<()>,
  election_tx: mpsc::UnboundedSender<()>,
  failover_tx: mpsc::UnboundedSender<FailoverSignal>,
}

impl WatchHandlers {
  /// Spawns the dispatcher and one task per concern.
  ///
  /// The dispatcher stops on shutdown or when the subscription ends; the
  /// handler tasks finish once the dispatcher drops their channels.
  pub fn spawn(
    self,
    events: mpsc::UnboundedReceiver<StoreEvent>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  ) -> Vec<JoinHandle<()>> {
    let (config_tx, config_rx) = mpsc::unbounded_channel();
    let (sharding_tx, sharding_rx) = mpsc::unbounded_channel();
    let (election_tx, election_rx) = mpsc::unbounded_channel();
    let (failover_tx, failover_rx) = mpsc::unbounded_channel();
    let routes = Routes {
      config_tx,
      sharding_tx,
      election_tx,
      failover_tx,
    };
    vec![
      tokio::spawn(self.clone().dispatch(events, routes, shutdown_rx)),
      tokio::spawn(self.clone().config_changed(config_rx)),
      tokio::spawn(self.clone().sharding_changed(sharding_rx)),
      tokio::spawn(self.clone().leader_changed(election_rx)),
      tokio::spawn(self.failover_signalled(failover_rx)),
    ]
  }

  async fn dispatch(
    self,
    mut events: mpsc::UnboundedReceiver<StoreEvent>,
    routes: Routes,
    mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  ) {
    loop {
      tokio::select! {
        biased;
        changed = shutdown_rx.changed() => {
          if changed.is_err() || shutdown_rx.borrow().is_some() {
            break;
          }
        }
        event = events.recv() => match event {
          Some(event) => self.route(event, &routes),
          None => break,
        },
      }
    }
    debug!(job_name = %self.path.job_name(), "Watch dispatcher stopped.");
  }

  fn route(&self, event: StoreEvent, routes: &Routes) {
    let Some(relative) = self.path.relative(&event.path) else {
      return;
    };
    trace!(job_name = %self.path.job_name(), path = relative, kind = ?event.kind, "Store event.");
    if relative.starts_with(SHARDING) || relative.starts_with("leader/") {
      self.poll.wake_all();
    }

    let removed = event.kind == StoreEventKind::Removed;
    if relative == CONFIG {
      if let (false, Some(raw)) = (removed, event.value) {
        let _ = routes.config_tx.send(raw);
      }
    } else if let Some(instance) = JobNodePath::parse_server(relative) {
      let _ = routes.sharding_tx.send(());
      if removed && &instance != self.instances.local() {
        let _ = routes.failover_tx.send(FailoverSignal::InstanceCrashed(instance));
      }
    } else if relative == LEADER_INSTANCE {
      if removed {
        let _ = routes.election_tx.send(());
      }
    } else if let Some((item, ItemNode::Disabled)) = JobNodePath::parse_item(relative) {
      debug!(job_name = %self.path.job_name(), item, disabled = !removed, "Item availability changed.");
      let _ = routes.sharding_tx.send(());
    } else if let Some(item) = relative
      .strip_prefix(FAILOVER)
      .and_then(|rest| rest.strip_prefix('/'))
      .and_then(|item| item.parse().ok())
    {
      if event.kind == StoreEventKind::Created {
        let _ = routes.failover_tx.send(FailoverSignal::EntryQueued(item));
      }
    }
  }

  async fn config_changed(self, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(raw) = rx.recv().await {
      let previous = self.config.load(true).await.ok();
      match self.config.refresh_cache(&raw) {
        Ok(current) => {
          let total_changed = previous
            .map(|p| p.sharding_total_count != current.sharding_total_count)
            .unwrap_or(true);
          if total_changed {
            debug!(job_name = %current.job_name, total = current.sharding_total_count, "Sharding total changed.");
            if let Err(e) = self.sharding.set_resharding_flag().await {
              warn!(job_name = %self.path.job_name(), error = %e, "Failed to flag resharding.");
            }
          }
        }
        Err(e) => warn!(job_name = %self.path.job_name(), error = %e, "Ignoring unreadable configuration."),
      }
    }
  }

  async fn sharding_changed(self, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
      // Collapse bursts into a single flag write.
      while rx.try_recv().is_ok() {}
      if let Err(e) = self.sharding.set_resharding_flag().await {
        warn!(job_name = %self.path.job_name(), error = %e, "Failed to flag resharding.");
      }
    }
  }

  async fn leader_changed(self, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
      if let Err(e) = self.re_elect().await {
        warn!(job_name = %self.path.job_name(), error = %e, "Re-election failed.");
      }
    }
  }

  async fn re_elect(&self) -> StoreResult<()> {
    if self.instances.is_live(self.instances.local()).await? {
      self.election.elect().await?;
    }
    Ok(())
  }

  async fn failover_signalled(self, mut rx: mpsc::UnboundedReceiver<FailoverSignal>) {
    while let Some(signal) = rx.recv().await {
      let outcome = self.handle_failover(&signal).await;
      match outcome {
        Ok(claimed) if !claimed.is_empty() => {
          if self
            .trigger_tx
            .try_send(TriggerCommand::RunNow { responder: None })
            .is_err()
          {
            debug!(job_name = %self.path.job_name(), "Follow-up cycle already pending.");
          }
        }
        Ok(_) => {}
        Err(e) => warn!(job_name = %self.path.job_name(), error = %e, "Failover handling failed."),
      }
    }
  }

  async fn handle_failover(&self, signal: &FailoverSignal) -> Result<Vec<u32>, CycleError> {
    if !self.config.is_failover_enabled().await? {
      return Ok(Vec::new());
    }
    match signal {
      FailoverSignal::InstanceCrashed(crashed) => {
        let queued = self.failover.enqueue_crashed(crashed).await?;
        debug!(job_name = %self.path.job_name(), crashed = %crashed, queued, "Instance lost.");
      }
      FailoverSignal::EntryQueued(item) => {
        trace!(job_name = %self.path.job_name(), item, "Failover entry queued.");
      }
    }
    self.failover.failover_if_necessary().await
  }
}
