//! Job configuration and its persistence in the coordination store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, CycleError, StoreError};
use crate::storage::{JobNodeStorage, CONFIG};

pub const DEFAULT_SHARDING_STRATEGY: &str = "AVG_ALLOCATION";
pub const DEFAULT_ERROR_HANDLER: &str = "LOG";

/// Immutable identity and policy of a sharding job.
///
/// Persisted once at setup as JSON under the job's `config` node and only
/// replaced when a later setup carries `overwrite = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfiguration {
  pub job_name: String,
  pub sharding_total_count: u32,
  /// Trigger expression. Opaque to the coordination engine.
  pub cron: String,
  /// Identity of the job body type; a different value under the same name is a conflict.
  pub job_type: String,
  #[serde(default)]
  pub job_parameter: String,
  /// Per-item parameters in `0=a,1=b` form.
  #[serde(default)]
  pub sharding_item_parameters: String,
  #[serde(default = "default_true")]
  pub monitor_execution: bool,
  #[serde(default)]
  pub failover: bool,
  #[serde(default = "default_true")]
  pub misfire: bool,
  #[serde(default)]
  pub overwrite: bool,
  /// Tolerated clock drift against the store in seconds; negative disables the check.
  #[serde(default = "default_max_time_diff")]
  pub max_time_diff_seconds: i64,
  #[serde(default = "default_strategy")]
  pub sharding_strategy_type: String,
  #[serde(default = "default_error_handler")]
  pub error_handler_type: String,
  #[serde(default)]
  pub description: String,
}

fn default_true() -> bool {
  true
}

fn default_max_time_diff() -> i64 {
  -1
}

fn default_strategy() -> String {
  DEFAULT_SHARDING_STRATEGY.to_string()
}

fn default_error_handler() -> String {
  DEFAULT_ERROR_HANDLER.to_string()
}

impl JobConfiguration {
  /// Starts a builder with the required fields; everything else takes its default.
  pub fn builder(job_name: &str, cron: &str, sharding_total_count: u32) -> JobConfigurationBuilder {
    JobConfigurationBuilder {
      config: JobConfiguration {
        job_name: job_name.to_string(),
        sharding_total_count,
        cron: cron.to_string(),
        job_type: String::new(),
        job_parameter: String::new(),
        sharding_item_parameters: String::new(),
        monitor_execution: true,
        failover: false,
        misfire: true,
        overwrite: false,
        max_time_diff_seconds: default_max_time_diff(),
        sharding_strategy_type: default_strategy(),
        error_handler_type: default_error_handler(),
        description: String::new(),
      },
    }
  }

  /// Failover needs execution tracking to detect orphaned items.
  pub fn is_failover_enabled(&self) -> bool {
    self.failover && self.monitor_execution
  }

  /// Per-item parameters parsed from `sharding_item_parameters`.
  ///
  /// Malformed pairs and items outside `[0, sharding_total_count)` are skipped.
  pub fn item_parameters(&self) -> BTreeMap<u32, String> {
    parse_item_parameters(&self.sharding_item_parameters, self.sharding_total_count)
  }

  pub fn max_time_diff(&self) -> Option<Duration> {
    u64::try_from(self.max_time_diff_seconds)
      .ok()
      .map(Duration::from_secs)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidConfiguration {
      job_name: self.job_name.clone(),
      reason: reason.to_string(),
    };
    if self.job_name.is_empty() || self.job_name.contains('/') {
      return Err(invalid("job name must be non-empty and must not contain '/'"));
    }
    if self.sharding_total_count == 0 {
      return Err(invalid("sharding total count must be greater than zero"));
    }
    if self.cron.trim().is_empty() {
      return Err(invalid("cron expression must not be empty"));
    }
    Ok(())
  }
}

fn parse_item_parameters(raw: &str, total: u32) -> BTreeMap<u32, String> {
  let mut result = BTreeMap::new();
  for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
    let Some((item, value)) = pair.split_once('=') else {
      warn!(pair, "Ignoring sharding item parameter without '='.");
      continue;
    };
    match item.trim().parse::<u32>() {
      Ok(item) if item < total => {
        result.insert(item, value.trim().to_string());
      }
      _ => warn!(pair, total, "Ignoring sharding item parameter with invalid item."),
    }
  }
  result
}

/// Consuming builder for [`JobConfiguration`].
#[derive(Debug, Clone)]
pub struct JobConfigurationBuilder {
  config: JobConfiguration,
}

impl JobConfigurationBuilder {
  pub fn job_type(mut self, job_type: &str) -> Self {
    self.config.job_type = job_type.to_string();
    self
  }

  pub fn job_parameter(mut self, parameter: &str) -> Self {
    self.config.job_parameter = parameter.to_string();
    self
  }

  pub fn sharding_item_parameters(mut self, parameters: &str) -> Self {
    self.config.sharding_item_parameters = parameters.to_string();
    self
  }

  pub fn monitor_execution(mut self, enabled: bool) -> Self {
    self.config.monitor_execution = enabled;
    self
  }

  pub fn failover(mut self, enabled: bool) -> Self {
    self.config.failover = enabled;
    self
  }

  pub fn misfire(mut self, enabled: bool) -> Self {
    self.config.misfire = enabled;
    self
  }

  pub fn overwrite(mut self, enabled: bool) -> Self {
    self.config.overwrite = enabled;
    self
  }

  pub fn max_time_diff_seconds(mut self, seconds: i64) -> Self {
    self.config.max_time_diff_seconds = seconds;
    self
  }

  pub fn sharding_strategy_type(mut self, strategy: &str) -> Self {
    self.config.sharding_strategy_type = strategy.to_string();
    self
  }

  pub fn error_handler_type(mut self, handler: &str) -> Self {
    self.config.error_handler_type = handler.to_string();
    self
  }

  pub fn description(mut self, description: &str) -> Self {
    self.config.description = description.to_string();
    self
  }

  pub fn build(self) -> JobConfiguration {
    self.config
  }
}

/// Loads, persists and caches the job configuration.
///
/// The cache is refreshed by the configuration watch handler; cycles read
/// from it instead of the store.
#[derive(Debug, Clone)]
pub struct ConfigurationGateway {
  storage: JobNodeStorage,
  cached: Arc<RwLock<Option<JobConfiguration>>>,
}

impl ConfigurationGateway {
  pub fn new(storage: JobNodeStorage) -> Self {
    Self {
      storage,
      cached: Arc::new(RwLock::new(None)),
    }
  }

  /// Writes the configuration if none is registered yet or `overwrite` is set.
  pub async fn persist(&self, config: &JobConfiguration) -> Result<(), ConfigError> {
    config.validate()?;
    let existing = self.storage.is_node_existed(CONFIG).await?;
    if !existing || config.overwrite {
      let json = encode(config)?;
      self.storage.fill_node(CONFIG, &json).await?;
      info!(job_name = %config.job_name, overwrite = config.overwrite, "Job configuration persisted.");
    } else {
      debug!(job_name = %config.job_name, "Keeping registered job configuration.");
    }
    Ok(())
  }

  /// Fails if the job name is already registered for a different job type.
  pub async fn check_conflict(&self, local: &JobConfiguration) -> Result<(), ConfigError> {
    let Some(registered) = self.read_registered().await? else {
      return Ok(());
    };
    if registered.job_type != local.job_type {
      return Err(ConfigError::ConfigurationConflict {
        job_name: local.job_name.clone(),
        registered: registered.job_type,
        local: local.job_type.clone(),
      });
    }
    Ok(())
  }

  /// Reads the registered configuration, from cache when `from_cache` is set.
  pub async fn load(&self, from_cache: bool) -> Result<JobConfiguration, ConfigError> {
    if from_cache {
      if let Some(config) = self.cached.read().clone() {
        return Ok(config);
      }
    }
    let config = self
      .read_registered()
      .await?
      .ok_or_else(|| ConfigError::ConfigurationMissing(self.storage.job_name().to_string()))?;
    *self.cached.write() = Some(config.clone());
    Ok(config)
  }

  /// Replaces the cached configuration after a change notification.
  pub(crate) fn refresh_cache(&self, raw: &str) -> Result<JobConfiguration, ConfigError> {
    let config = decode(self.storage.job_name(), raw)?;
    *self.cached.write() = Some(config.clone());
    Ok(config)
  }

  pub async fn is_failover_enabled(&self) -> Result<bool, ConfigError> {
    Ok(self.load(true).await?.is_failover_enabled())
  }

  /// Checks the local clock against the store's.
  pub async fn check_max_time_diff(&self) -> Result<(), CycleError> {
    let config = self.load(true).await?;
    let Some(tolerance) = config.max_time_diff() else {
      return Ok(());
    };
    let store_time = self.storage.registry_center_time().await?;
    let drift = (store_time - Utc::now())
      .abs()
      .to_std()
      .unwrap_or(Duration::MAX);
    if drift > tolerance {
      return Err(CycleError::TimeDriftIntolerable { drift, tolerance });
    }
    Ok(())
  }

  async fn read_registered(&self) -> Result<Option<JobConfiguration>, ConfigError> {
    match self.storage.get_data(CONFIG).await? {
      Some(raw) => Ok(Some(decode(self.storage.job_name(), &raw)?)),
      None => Ok(None),
    }
  }
}

fn encode(config: &JobConfiguration) -> Result<String, StoreError> {
  serde_json::to_string(config).map_err(|e| StoreError::Codec {
    path: format!("/{}/{}", config.job_name, CONFIG),
    message: e.to_string(),
  })
}

fn decode(job_name: &str, raw: &str) -> Result<JobConfiguration, StoreError> {
  serde_json::from_str(raw).map_err(|e| StoreError::Codec {
    path: format!("/{}/{}", job_name, CONFIG),
    message: e.to_string(),
  })
}
