use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ConfigError;
use crate::scheduler::JobController;

/// Job name → controller for every job set up on one host.
///
/// Owned by the [`JobHost`](crate::JobHost) and shared with its handles;
/// there is no process-wide instance.
#[derive(Clone, Default)]
pub(crate) struct JobRegistry {
  jobs: Arc<RwLock<HashMap<String, Arc<JobController>>>>,
}

impl JobRegistry {
  pub fn insert(&self, controller: Arc<JobController>) -> Result<(), ConfigError> {
    let mut jobs = self.jobs.write();
    if jobs.contains_key(controller.name()) {
      return Err(ConfigError::AlreadyRegistered(controller.name().to_string()));
    }
    jobs.insert(controller.name().to_string(), controller);
    Ok(())
  }

  pub fn contains(&self, job_name: &str) -> bool {
    self.jobs.read().contains_key(job_name)
  }

  pub fn get(&self, job_name: &str) -> Option<Arc<JobController>> {
    self.jobs.read().get(job_name).cloned()
  }

  pub fn remove(&self, job_name: &str) -> Option<Arc<JobController>> {
    self.jobs.write().remove(job_name)
  }

  /// Registered job names, sorted.
  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.jobs.read().keys().cloned().collect();
    names.sort();
    names
  }
}

impl fmt::Debug for JobRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobRegistry").field("jobs", &self.names()).finish()
  }
}
