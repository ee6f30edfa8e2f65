//! The coordination store seam.
//!
//! Everything the coordination engine knows about the outside world goes
//! through [`CoordinatorStore`]: a hierarchical key/value service with
//! session-scoped ephemeral nodes, subtree change notifications, a mutual
//! exclusion latch and atomic multi-path writes. Paths are absolute,
//! `/`-separated, and parents are implicit.
//!
//! [`memory`] contains an in-process implementation used by tests and demos.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::StoreResult;

pub use memory::{MemoryCluster, MemoryStore};

/// Identifier of one client session against the store.
pub type SessionId = u64;

/// Kind of change carried by a [`StoreEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEventKind {
  Created,
  Updated,
  Removed,
}

/// A change notification for a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
  pub kind: StoreEventKind,
  pub path: String,
  /// The new value for `Created`/`Updated`, the last value for `Removed`.
  pub value: Option<String>,
}

/// One operation inside an atomic [`CoordinatorStore::commit`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
  /// Create a node; fails if it already exists.
  Create {
    path: String,
    value: String,
    ephemeral: bool,
  },
  /// Create or overwrite a persistent node.
  Set { path: String, value: String },
  /// Delete a node; fails if it does not exist.
  Delete { path: String },
  /// Fails unless the node exists.
  CheckExists { path: String },
}

impl TxnOp {
  pub fn path(&self) -> &str {
    match self {
      TxnOp::Create { path, .. }
      | TxnOp::Set { path, .. }
      | TxnOp::Delete { path }
      | TxnOp::CheckExists { path } => path,
    }
  }
}

/// Client interface to the coordination store, bound to one session.
///
/// Ephemeral nodes and latches created through a handle are owned by its
/// session and disappear (emitting `Removed` events) when the session is
/// closed or expires.
#[async_trait]
pub trait CoordinatorStore: Send + Sync + fmt::Debug {
  /// The session this handle operates under.
  fn session_id(&self) -> SessionId;

  /// Creates or overwrites a persistent node.
  async fn persist(&self, path: &str, value: &str) -> StoreResult<()>;

  /// Creates or overwrites an ephemeral node owned by this session.
  async fn persist_ephemeral(&self, path: &str, value: &str) -> StoreResult<()>;

  async fn read(&self, path: &str) -> StoreResult<Option<String>>;

  /// True if the node or any descendant exists.
  async fn exists(&self, path: &str) -> StoreResult<bool>;

  /// Sorted names of the direct children of `path`.
  async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

  /// Removes the node and its whole subtree. Removing a missing node is not an error.
  async fn remove(&self, path: &str) -> StoreResult<()>;

  /// Applies every operation or none of them.
  async fn commit(&self, ops: Vec<TxnOp>) -> StoreResult<()>;

  /// Registers a watch on every node under `prefix` (inclusive).
  ///
  /// Events are delivered in commit order until the receiver is dropped.
  fn subscribe(&self, prefix: &str) -> StoreResult<mpsc::UnboundedReceiver<StoreEvent>>;

  /// Waits until this session holds the latch at `path`. Re-entrant for the holder.
  async fn acquire_latch(&self, path: &str) -> StoreResult<()>;

  /// Releases the latch if this session holds it.
  async fn release_latch(&self, path: &str) -> StoreResult<()>;

  /// The store's notion of the current time, used for clock drift checks.
  async fn server_time(&self) -> StoreResult<DateTime<Utc>>;

  /// Ends the session, dropping its ephemeral nodes and latches.
  async fn close(&self) -> StoreResult<()>;
}
