//! Pluggable handling of item and listener errors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::DEFAULT_ERROR_HANDLER;
use crate::error::{BuildError, JobError};

/// Decides what happens to an error raised by an item body or a listener.
///
/// Returning `Err` hands the error back to the cycle, which finishes its
/// bookkeeping and then reports it as [`CycleError::Propagated`](crate::error::CycleError::Propagated).
pub trait JobErrorHandler: Send + Sync + fmt::Debug {
  fn handle_error(&self, job_name: &str, error: &JobError) -> Result<(), JobError>;
}

/// Logs at error level and swallows. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorHandler;

impl JobErrorHandler for LogErrorHandler {
  fn handle_error(&self, job_name: &str, error: &JobError) -> Result<(), JobError> {
    error!(job_name, error = %error, "Job error.");
    Ok(())
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreErrorHandler;

impl JobErrorHandler for IgnoreErrorHandler {
  fn handle_error(&self, job_name: &str, error: &JobError) -> Result<(), JobError> {
    debug!(job_name, error = %error, "Ignoring job error.");
    Ok(())
  }
}

/// Surfaces every error to the caller of the cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropagateErrorHandler;

impl JobErrorHandler for PropagateErrorHandler {
  fn handle_error(&self, _job_name: &str, error: &JobError) -> Result<(), JobError> {
    Err(error.clone())
  }
}

/// Forwards `(job_name, error)` pairs to a channel, e.g. for alerting.
#[derive(Debug, Clone)]
pub struct ChannelErrorHandler {
  tx: mpsc::UnboundedSender<(String, JobError)>,
}

impl ChannelErrorHandler {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, JobError)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl JobErrorHandler for ChannelErrorHandler {
  fn handle_error(&self, job_name: &str, error: &JobError) -> Result<(), JobError> {
    if self.tx.send((job_name.to_string(), error.clone())).is_err() {
      warn!(job_name, error = %error, "Error notification receiver dropped.");
    }
    Ok(())
  }
}

pub type ErrorHandlerFactory = Arc<dyn Fn() -> Arc<dyn JobErrorHandler> + Send + Sync>;

/// Name → error handler constructor, resolved at job setup.
#[derive(Clone)]
pub struct ErrorHandlerRegistry {
  factories: HashMap<String, ErrorHandlerFactory>,
}

impl fmt::Debug for ErrorHandlerRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<&String> = self.factories.keys().collect();
    names.sort();
    f.debug_struct("ErrorHandlerRegistry").field("names", &names).finish()
  }
}

impl Default for ErrorHandlerRegistry {
  fn default() -> Self {
    let mut registry = Self {
      factories: HashMap::new(),
    };
    registry.register(DEFAULT_ERROR_HANDLER, || Arc::new(LogErrorHandler) as Arc<dyn JobErrorHandler>);
    registry.register("IGNORE", || Arc::new(IgnoreErrorHandler) as Arc<dyn JobErrorHandler>);
    registry.register("PROPAGATE", || Arc::new(PropagateErrorHandler) as Arc<dyn JobErrorHandler>);
    registry
  }
}

impl ErrorHandlerRegistry {
  pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
  where
    F: Fn() -> Arc<dyn JobErrorHandler> + Send + Sync + 'static,
  {
    self.factories.insert(name.to_string(), Arc::new(factory));
    self
  }

  /// Registers one shared handler instance under `name`.
  pub fn register_instance(&mut self, name: &str, handler: Arc<dyn JobErrorHandler>) -> &mut Self {
    self.register(name, move || handler.clone())
  }

  pub fn resolve(&self, name: &str) -> Result<Arc<dyn JobErrorHandler>, BuildError> {
    self
      .factories
      .get(name)
      .map(|factory| factory())
      .ok_or_else(|| BuildError::UnknownErrorHandler(name.to_string()))
  }
}
