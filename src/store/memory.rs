//! In-process coordination store.
//!
//! A [`MemoryCluster`] holds the shared tree; every [`MemoryStore`] obtained
//! from [`MemoryCluster::connect`] is an independent session, so several
//! "processes" can be simulated inside one test. Expiring a session through
//! the cluster behaves like a crashed instance losing its connection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use super::{CoordinatorStore, SessionId, StoreEvent, StoreEventKind, TxnOp};
use crate::error::{StoreError, StoreResult};

const LATCH_RECHECK: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct Node {
  value: String,
  owner: Option<SessionId>,
}

#[derive(Debug)]
struct Subscriber {
  prefix: String,
  tx: mpsc::UnboundedSender<StoreEvent>,
}

#[derive(Debug, Default)]
struct ClusterState {
  nodes: BTreeMap<String, Node>,
  subscribers: Vec<Subscriber>,
  latches: HashMap<String, SessionId>,
  closed: HashSet<SessionId>,
  clock_skew: ChronoDuration,
}

impl ClusterState {
  fn ensure_open(&self, session: SessionId) -> StoreResult<()> {
    if self.closed.contains(&session) {
      Err(StoreError::SessionClosed(session))
    } else {
      Ok(())
    }
  }

  fn has_subtree(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    if nodes.contains_key(path) {
      return true;
    }
    let prefix = subtree_prefix(path);
    nodes
      .range(prefix.clone()..)
      .next()
      .is_some_and(|(key, _)| key.starts_with(&prefix))
  }

  fn put(
    nodes: &mut BTreeMap<String, Node>,
    events: &mut Vec<StoreEvent>,
    path: &str,
    value: &str,
    owner: Option<SessionId>,
  ) {
    let kind = if nodes.contains_key(path) {
      StoreEventKind::Updated
    } else {
      StoreEventKind::Created
    };
    nodes.insert(
      path.to_string(),
      Node {
        value: value.to_string(),
        owner,
      },
    );
    events.push(StoreEvent {
      kind,
      path: path.to_string(),
      value: Some(value.to_string()),
    });
  }

  fn remove_subtree(nodes: &mut BTreeMap<String, Node>, events: &mut Vec<StoreEvent>, path: &str) {
    let prefix = subtree_prefix(path);
    let doomed: Vec<String> = nodes
      .keys()
      .filter(|key| key.as_str() == path || key.starts_with(&prefix))
      .cloned()
      .collect();
    // Deepest first, like a recursive delete would report them.
    for key in doomed.into_iter().rev() {
      if let Some(node) = nodes.remove(&key) {
        events.push(StoreEvent {
          kind: StoreEventKind::Removed,
          path: key,
          value: Some(node.value),
        });
      }
    }
  }

  fn publish(&mut self, events: Vec<StoreEvent>) {
    if events.is_empty() {
      return;
    }
    self.subscribers.retain(|sub| !sub.tx.is_closed());
    for event in events {
      trace!(path = %event.path, kind = ?event.kind, "Store event.");
      for sub in &self.subscribers {
        if event.path == sub.prefix || event.path.starts_with(&subtree_prefix(&sub.prefix)) {
          // A dropped receiver is pruned on the next publish.
          let _ = sub.tx.send(event.clone());
        }
      }
    }
  }

  fn end_session(&mut self, session: SessionId) -> bool {
    if !self.closed.insert(session) {
      return false;
    }
    let owned: Vec<String> = self
      .nodes
      .iter()
      .filter(|(_, node)| node.owner == Some(session))
      .map(|(path, _)| path.clone())
      .collect();
    let mut events = Vec::with_capacity(owned.len());
    for path in owned {
      if let Some(node) = self.nodes.remove(&path) {
        events.push(StoreEvent {
          kind: StoreEventKind::Removed,
          path,
          value: Some(node.value),
        });
      }
    }
    self.latches.retain(|_, holder| *holder != session);
    self.publish(events);
    true
  }
}

fn subtree_prefix(path: &str) -> String {
  if path.ends_with('/') {
    path.to_string()
  } else {
    format!("{}/", path)
  }
}

#[derive(Debug, Default)]
struct ClusterInner {
  state: Mutex<ClusterState>,
  latch_released: Notify,
  next_session: AtomicU64,
}

/// Shared in-memory tree. Cloning shares the same cluster.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
  inner: Arc<ClusterInner>,
}

impl MemoryCluster {
  pub fn new() -> Self {
    Self::default()
  }

  /// Opens a new session against the cluster.
  pub fn connect(&self) -> MemoryStore {
    let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(session, "Memory store session opened.");
    MemoryStore {
      cluster: self.clone(),
      session,
    }
  }

  /// Expires a session as if its owner lost the connection.
  pub fn expire_session(&self, session: SessionId) {
    let ended = self.inner.state.lock().end_session(session);
    if ended {
      debug!(session, "Memory store session expired.");
      self.inner.latch_released.notify_waiters();
    }
  }

  /// Skews the store clock relative to the local clock.
  pub fn set_clock_skew(&self, skew: ChronoDuration) {
    self.inner.state.lock().clock_skew = skew;
  }

  /// Reads a node directly, bypassing any session.
  pub fn get(&self, path: &str) -> Option<String> {
    self
      .inner
      .state
      .lock()
      .nodes
      .get(path)
      .map(|node| node.value.clone())
  }

  /// All node paths currently stored under `prefix`, in order.
  pub fn paths_under(&self, prefix: &str) -> Vec<String> {
    let sub = subtree_prefix(prefix);
    self
      .inner
      .state
      .lock()
      .nodes
      .keys()
      .filter(|key| key.as_str() == prefix || key.starts_with(&sub))
      .cloned()
      .collect()
  }
}

/// One session against a [`MemoryCluster`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
  cluster: MemoryCluster,
  session: SessionId,
}

impl MemoryStore {
  pub fn cluster(&self) -> &MemoryCluster {
    &self.cluster
  }

  fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> StoreResult<T>) -> StoreResult<T> {
    let mut state = self.cluster.inner.state.lock();
    state.ensure_open(self.session)?;
    f(&mut state)
  }

  fn write(&self, path: &str, value: &str, owner: Option<SessionId>) -> StoreResult<()> {
    self.with_state(|state| {
      let mut events = Vec::with_capacity(1);
      ClusterState::put(&mut state.nodes, &mut events, path, value, owner);
      state.publish(events);
      Ok(())
    })
  }
}

#[async_trait]
impl CoordinatorStore for MemoryStore {
  fn session_id(&self) -> SessionId {
    self.session
  }

  async fn persist(&self, path: &str, value: &str) -> StoreResult<()> {
    self.write(path, value, None)
  }

  async fn persist_ephemeral(&self, path: &str, value: &str) -> StoreResult<()> {
    self.write(path, value, Some(self.session))
  }

  async fn read(&self, path: &str) -> StoreResult<Option<String>> {
    self.with_state(|state| Ok(state.nodes.get(path).map(|node| node.value.clone())))
  }

  async fn exists(&self, path: &str) -> StoreResult<bool> {
    self.with_state(|state| Ok(ClusterState::has_subtree(&state.nodes, path)))
  }

  async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
    self.with_state(|state| {
      let prefix = subtree_prefix(path);
      let names: BTreeSet<String> = state
        .nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| key[prefix.len()..].split('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
      Ok(names.into_iter().collect())
    })
  }

  async fn remove(&self, path: &str) -> StoreResult<()> {
    self.with_state(|state| {
      let mut events = Vec::new();
      ClusterState::remove_subtree(&mut state.nodes, &mut events, path);
      state.publish(events);
      Ok(())
    })
  }

  async fn commit(&self, ops: Vec<TxnOp>) -> StoreResult<()> {
    let session = self.session;
    self.with_state(|state| {
      let mut scratch = state.nodes.clone();
      let mut events = Vec::with_capacity(ops.len());
      for (index, op) in ops.iter().enumerate() {
        let failed = |reason: &str| StoreError::TransactionFailed {
          index,
          path: op.path().to_string(),
          reason: reason.to_string(),
        };
        match op {
          TxnOp::Create {
            path,
            value,
            ephemeral,
          } => {
            if scratch.contains_key(path) {
              return Err(failed("node exists"));
            }
            let owner = (*ephemeral).then_some(session);
            ClusterState::put(&mut scratch, &mut events, path, value, owner);
          }
          TxnOp::Set { path, value } => {
            ClusterState::put(&mut scratch, &mut events, path, value, None);
          }
          TxnOp::Delete { path } => {
            if !scratch.contains_key(path) {
              return Err(failed("no node"));
            }
            ClusterState::remove_subtree(&mut scratch, &mut events, path);
          }
          TxnOp::CheckExists { path } => {
            if !ClusterState::has_subtree(&scratch, path) {
              return Err(failed("no node"));
            }
          }
        }
      }
      state.nodes = scratch;
      state.publish(events);
      Ok(())
    })
  }

  fn subscribe(&self, prefix: &str) -> StoreResult<mpsc::UnboundedReceiver<StoreEvent>> {
    let mut state = self.cluster.inner.state.lock();
    state.ensure_open(self.session)?;
    let (tx, rx) = mpsc::unbounded_channel();
    state.subscribers.push(Subscriber {
      prefix: prefix.to_string(),
      tx,
    });
    Ok(rx)
  }

  async fn acquire_latch(&self, path: &str) -> StoreResult<()> {
    loop {
      let acquired = self.with_state(|state| match state.latches.get(path) {
        Some(holder) if *holder != self.session => Ok(false),
        _ => {
          state.latches.insert(path.to_string(), self.session);
          Ok(true)
        }
      })?;
      if acquired {
        trace!(session = self.session, path, "Latch acquired.");
        return Ok(());
      }
      // The timeout covers a release that lands between the check and the wait.
      let _ = tokio::time::timeout(LATCH_RECHECK, self.cluster.inner.latch_released.notified()).await;
    }
  }

  async fn release_latch(&self, path: &str) -> StoreResult<()> {
    let released = {
      let mut state = self.cluster.inner.state.lock();
      match state.latches.get(path) {
        Some(holder) if *holder == self.session => {
          state.latches.remove(path);
          true
        }
        _ => false,
      }
    };
    if released {
      self.cluster.inner.latch_released.notify_waiters();
    }
    Ok(())
  }

  async fn server_time(&self) -> StoreResult<DateTime<Utc>> {
    self.with_state(|state| Ok(Utc::now() + state.clock_skew))
  }

  async fn close(&self) -> StoreResult<()> {
    self.cluster.expire_session(self.session);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn ephemeral_nodes_vanish_with_their_session() {
    let cluster = MemoryCluster::new();
    let a = cluster.connect();
    let b = cluster.connect();
    let mut events = b.subscribe("/job").unwrap();

    a.persist_ephemeral("/job/servers/a", "").await.unwrap();
    a.persist("/job/sharding/0/running", "a").await.unwrap();
    cluster.expire_session(a.session_id());

    assert!(!b.exists("/job/servers/a").await.unwrap());
    assert!(b.exists("/job/sharding/0/running").await.unwrap());
    assert!(matches!(
      a.read("/job/servers").await,
      Err(StoreError::SessionClosed(_))
    ));

    let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
      .map(|e| (e.kind, e.path))
      .collect();
    assert_eq!(
      kinds,
      vec![
        (StoreEventKind::Created, "/job/servers/a".to_string()),
        (StoreEventKind::Created, "/job/sharding/0/running".to_string()),
        (StoreEventKind::Removed, "/job/servers/a".to_string()),
      ]
    );
  }

  #[tokio::test]
  async fn children_are_distinct_sorted_names() {
    let store = MemoryCluster::new().connect();
    store.persist("/j/sharding/1/instance", "x").await.unwrap();
    store.persist("/j/sharding/0/instance", "y").await.unwrap();
    store.persist("/j/sharding/0/running", "y").await.unwrap();
    store.persist("/j/sharding/necessary", "").await.unwrap();
    assert_eq!(
      store.children("/j/sharding").await.unwrap(),
      vec!["0", "1", "necessary"]
    );
    assert!(store.children("/j/missing").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn failed_transaction_applies_nothing() {
    let store = MemoryCluster::new().connect();
    store.persist("/j/failover/4", "").await.unwrap();
    let ops = vec![
      TxnOp::Set {
        path: "/j/sharding/4/failover".into(),
        value: "me".into(),
      },
      TxnOp::Delete {
        path: "/j/failover/5".into(),
      },
    ];
    let err = store.commit(ops).await.unwrap_err();
    assert!(matches!(err, StoreError::TransactionFailed { index: 1, .. }));
    assert_eq!(store.read("/j/sharding/4/failover").await.unwrap(), None);
  }

  #[tokio::test]
  async fn latch_is_exclusive_until_released() {
    let cluster = MemoryCluster::new();
    let a = cluster.connect();
    let b = cluster.connect();
    a.acquire_latch("/j/leader/election/latch").await.unwrap();

    let waiter = tokio::spawn(async move {
      b.acquire_latch("/j/leader/election/latch").await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    a.release_latch("/j/leader/election/latch").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("second session should acquire after release")
      .unwrap();
  }
}
