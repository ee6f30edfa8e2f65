//! Pluggable item allocation strategies.
//!
//! Strategies are resolved by name from a [`StrategyRegistry`] when a job is
//! set up. Every strategy must be a pure function of the instance set, job
//! name and total count so followers can recompute the same result.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::DEFAULT_SHARDING_STRATEGY;
use crate::error::BuildError;
use crate::instance::InstanceId;

pub type Assignment = BTreeMap<InstanceId, Vec<u32>>;

pub trait ShardingStrategy: Send + Sync + fmt::Debug {
  /// Partitions `[0, total)` over `instances`. Every live instance gets an
  /// entry, possibly empty.
  fn allocate(&self, instances: &[InstanceId], job_name: &str, total: u32) -> Assignment;
}

fn sorted_unique(instances: &[InstanceId]) -> Vec<InstanceId> {
  let mut sorted = instances.to_vec();
  sorted.sort();
  sorted.dedup();
  sorted
}

/// Contiguous ranges over `ordered`; the first `total % n` instances get one extra item.
fn allocate_in_order(ordered: &[InstanceId], total: u32) -> Assignment {
  let mut result = Assignment::new();
  if ordered.is_empty() {
    return result;
  }
  let count = ordered.len() as u32;
  let base = total / count;
  let remainder = total % count;
  let mut next = 0;
  for (index, instance) in ordered.iter().enumerate() {
    let share = base + u32::from((index as u32) < remainder);
    result.insert(instance.clone(), (next..next + share).collect());
    next += share;
  }
  result
}

/// Java-style `String.hashCode`, stable across processes and builds.
fn name_hash(job_name: &str) -> i32 {
  job_name
    .encode_utf16()
    .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// The default: contiguous, near-equal ranges in sorted instance order.
///
/// 3 instances and 9 items yield `[0,1,2] [3,4,5] [6,7,8]`; 2 instances and
/// 9 items yield `[0..=4] [5..=8]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageAllocationStrategy;

impl ShardingStrategy for AverageAllocationStrategy {
  fn allocate(&self, instances: &[InstanceId], _job_name: &str, total: u32) -> Assignment {
    allocate_in_order(&sorted_unique(instances), total)
  }
}

/// Average allocation, with the instance order reversed for job names whose
/// hash is even. Spreads the extra items of many small jobs across hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct OdevitySortByNameStrategy;

impl ShardingStrategy for OdevitySortByNameStrategy {
  fn allocate(&self, instances: &[InstanceId], job_name: &str, total: u32) -> Assignment {
    let mut ordered = sorted_unique(instances);
    if name_hash(job_name) % 2 == 0 {
      ordered.reverse();
    }
    allocate_in_order(&ordered, total)
  }
}

/// Average allocation over the instance list rotated by the job name hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct RotateServerByNameStrategy;

impl ShardingStrategy for RotateServerByNameStrategy {
  fn allocate(&self, instances: &[InstanceId], job_name: &str, total: u32) -> Assignment {
    let mut ordered = sorted_unique(instances);
    if !ordered.is_empty() {
      let offset = name_hash(job_name).unsigned_abs() as usize % ordered.len();
      ordered.rotate_left(offset);
    }
    allocate_in_order(&ordered, total)
  }
}

pub type StrategyFactory = Arc<dyn Fn() -> Arc<dyn ShardingStrategy> + Send + Sync>;

/// Name → strategy constructor, resolved at job setup.
#[derive(Clone)]
pub struct StrategyRegistry {
  factories: HashMap<String, StrategyFactory>,
}

impl fmt::Debug for StrategyRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<&String> = self.factories.keys().collect();
    names.sort();
    f.debug_struct("StrategyRegistry").field("names", &names).finish()
  }
}

impl Default for StrategyRegistry {
  fn default() -> Self {
    let mut registry = Self {
      factories: HashMap::new(),
    };
    registry.register(DEFAULT_SHARDING_STRATEGY, || Arc::new(AverageAllocationStrategy) as Arc<dyn ShardingStrategy>);
    registry.register("ODEVITY", || Arc::new(OdevitySortByNameStrategy) as Arc<dyn ShardingStrategy>);
    registry.register("ROUND_ROBIN", || Arc::new(RotateServerByNameStrategy) as Arc<dyn ShardingStrategy>);
    registry
  }
}

impl StrategyRegistry {
  /// Registers (or replaces) a strategy under `name`.
  pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
  where
    F: Fn() -> Arc<dyn ShardingStrategy> + Send + Sync + 'static,
  {
    self.factories.insert(name.to_string(), Arc::new(factory));
    self
  }

  pub fn resolve(&self, name: &str) -> Result<Arc<dyn ShardingStrategy>, BuildError> {
    self
      .factories
      .get(name)
      .map(|factory| factory())
      .ok_or_else(|| BuildError::UnknownStrategy(name.to_string()))
  }
}
