use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`CoordinatorStore`](crate::store::CoordinatorStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  /// One operation of an atomic batch failed; nothing in the batch was applied.
  #[error("Transaction aborted at operation {index} ({path}): {reason}")]
  TransactionFailed {
    index: usize,
    path: String,
    reason: String,
  },
  #[error("Store session {0} is closed or expired.")]
  SessionClosed(u64),
  #[error("Failed to encode/decode node value at {path}: {message}")]
  Codec { path: String, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while building a `JobHost` with `JobHostBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("A coordination store must be provided to the builder")]
  MissingStore,
  #[error("Maximum worker count (`max_workers`) must be specified and greater than zero")]
  MissingOrZeroMaxWorkers,
  #[error("Unknown sharding strategy type: {0}")]
  UnknownStrategy(String),
  #[error("Unknown job error handler type: {0}")]
  UnknownErrorHandler(String),
}

/// Errors raised while registering or loading a job configuration.
///
/// All of these are fatal for `JobHost::setup`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error(
    "Job conflict: job `{job_name}` is registered as `{registered}` but is being set up as `{local}`"
  )]
  ConfigurationConflict {
    job_name: String,
    registered: String,
    local: String,
  },
  #[error("Invalid configuration for job `{job_name}`: {reason}")]
  InvalidConfiguration { job_name: String, reason: String },
  #[error("No configuration registered for job `{0}`")]
  ConfigurationMissing(String),
  #[error("Job `{0}` is already set up on this host")]
  AlreadyRegistered(String),
  #[error(transparent)]
  Build(#[from] BuildError),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// An error produced by a single sharding item or a listener.
///
/// These never abort a cycle; they are routed to the job's
/// [`JobErrorHandler`](crate::handler::JobErrorHandler).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
  #[error("Item {item} of job `{job_name}` failed: {message}")]
  ItemFailed {
    job_name: String,
    item: u32,
    message: String,
  },
  #[error("Item {item} of job `{job_name}` panicked")]
  ItemPanicked { job_name: String, item: u32 },
  /// A cycle stopped before executing any item, e.g. on intolerable clock drift.
  #[error("Cycle of job `{job_name}` aborted: {message}")]
  CycleAborted { job_name: String, message: String },
  #[error("Listener `{listener}` failed for job `{job_name}`: {message}")]
  ListenerFailed {
    job_name: String,
    listener: String,
    message: String,
  },
}

/// Errors that end a single cycle early (or are surfaced after it).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CycleError {
  #[error(
    "Time drift between this host and the coordination store is {drift:?}, tolerance is {tolerance:?}"
  )]
  TimeDriftIntolerable { drift: Duration, tolerance: Duration },
  #[error("Job `{0}` is not set up on this host")]
  JobNotFound(String),
  #[error("Job `{0}` has been shut down")]
  JobShutdown(String),
  /// Item or listener errors forwarded by a propagating error handler.
  /// Bookkeeping for the cycle already completed when this is returned.
  #[error("{} job error(s) propagated by the error handler", .0.len())]
  Propagated(Vec<JobError>),
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors related to the host shutdown process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (job already shut down).")]
  SignalFailed,
  #[error("Timed out waiting for trigger and listener tasks to complete shutdown.")]
  Timeout,
  #[error("A trigger or listener task panicked during the shutdown process.")]
  TaskPanic,
  #[error("Job `{0}` is not set up on this host")]
  JobNotFound(String),
  #[error(transparent)]
  Store(#[from] StoreError),
}
