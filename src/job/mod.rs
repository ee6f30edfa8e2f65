#[cfg(feature = "job_context")]
pub mod context;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
#[cfg(feature = "cron_schedule")]
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
#[cfg(feature = "cron_schedule")]
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::JobConfiguration;

/// Outcome of one item body. The `Err` message is wrapped in a
/// [`JobError::ItemFailed`](crate::error::JobError::ItemFailed) and routed to the error handler.
pub type ItemResult = Result<(), String>;

/// The function a job runs once per sharding item per cycle.
///
/// Panics inside the returned future are caught and reported as
/// [`JobError::ItemPanicked`](crate::error::JobError::ItemPanicked); they never
/// abort sibling items or the completion bookkeeping.
pub type BoxedItemFn = Box<
  dyn Fn(ShardingContext) -> Pin<Box<dyn Future<Output = ItemResult> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

/// What one item execution gets to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingContext {
  pub job_name: String,
  /// Unique per cycle; shared by every item of that cycle.
  pub task_id: Uuid,
  pub sharding_total_count: u32,
  pub job_parameter: String,
  pub item: u32,
  pub item_parameter: Option<String>,
}

/// The items one instance executes in one cycle. Handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingContexts {
  pub job_name: String,
  pub task_id: Uuid,
  pub sharding_total_count: u32,
  pub job_parameter: String,
  /// Item → its parameter (empty when none was configured).
  pub items: BTreeMap<u32, String>,
}

impl ShardingContexts {
  pub(crate) fn new(config: &JobConfiguration, items: &[u32]) -> Self {
    let parameters = config.item_parameters();
    Self {
      job_name: config.job_name.clone(),
      task_id: Uuid::new_v4(),
      sharding_total_count: config.sharding_total_count,
      job_parameter: config.job_parameter.clone(),
      items: items
        .iter()
        .map(|item| (*item, parameters.get(item).cloned().unwrap_or_default()))
        .collect(),
    }
  }

  pub fn item_numbers(&self) -> Vec<u32> {
    self.items.keys().copied().collect()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub(crate) fn for_item(&self, item: u32) -> ShardingContext {
    ShardingContext {
      job_name: self.job_name.clone(),
      task_id: self.task_id,
      sharding_total_count: self.sharding_total_count,
      job_parameter: self.job_parameter.clone(),
      item,
      item_parameter: self.items.get(&item).filter(|p| !p.is_empty()).cloned(),
    }
  }

  /// The same cycle narrowed to `items`, for misfire catch-up runs.
  pub(crate) fn restrict_to(&self, items: &[u32]) -> Self {
    Self {
      items: self
        .items
        .iter()
        .filter(|(item, _)| items.contains(item))
        .map(|(item, p)| (*item, p.clone()))
        .collect(),
      ..self.clone()
    }
  }
}

/// Hooks around every cycle that executes at least one item.
///
/// Errors are routed to the job's error handler and never abort the cycle.
pub trait JobListener: Send + Sync {
  fn name(&self) -> &str {
    std::any::type_name::<Self>()
  }

  fn before_job_executed(&self, _contexts: &ShardingContexts) -> Result<(), String> {
    Ok(())
  }

  fn after_job_executed(&self, _contexts: &ShardingContexts) -> Result<(), String> {
    Ok(())
  }
}

impl fmt::Debug for dyn JobListener {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobListener").field("name", &self.name()).finish()
  }
}

/// When the trigger loop fires cycles for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
  /// Standard CRON expression with a seconds field, UTC.
  #[cfg(feature = "cron_schedule")]
  Cron(String),
  /// Repeatedly, `interval` after the previous due time.
  FixedInterval(StdDuration),
  /// Once at the given time.
  Once(DateTime<Utc>),
  /// Only on explicit `trigger_now` requests.
  Never,
}

impl Schedule {
  /// The first due time strictly after `reference_time`, if any.
  pub(crate) fn calculate_next_run(&self, reference_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      #[cfg(feature = "cron_schedule")]
      Schedule::Cron(expression) => match CronSchedule::from_str(expression) {
        Ok(cron_schedule) => cron_schedule.after(&reference_time).next(),
        Err(e) => {
          warn!("Failed to parse cron expression '{}': {}", expression, e);
          None
        }
      },
      Schedule::FixedInterval(interval) => match ChronoDuration::from_std(*interval) {
        Ok(chrono_interval) => reference_time.checked_add_signed(chrono_interval),
        Err(e) => {
          warn!("Failed to convert interval duration {:?}: {}", interval, e);
          None
        }
      },
      Schedule::Once(run_at) => (reference_time < *run_at).then_some(*run_at),
      Schedule::Never => None,
    }
  }
}
