//! ShardKeeper: Distributed Sharding-Job Coordination
//!
//! Lets several processes run the same periodic job cooperatively. The job's
//! work is split into numbered sharding items; at every trigger each live
//! instance executes only the items assigned to it. All coordination goes
//! through a watchable hierarchical store ([`store::CoordinatorStore`]).
//!
//! # Features
//!
//! - One leader per job, re-elected when it leaves.
//! - Lazy resharding: membership, total-count and item availability changes
//!   only raise a flag; the next cycle waits for running items to drain and
//!   the leader publishes a new assignment atomically.
//! - Pluggable sharding strategies (`AVG_ALLOCATION`, `ODEVITY`,
//!   `ROUND_ROBIN`) through [`StrategyRegistry`].
//! - Per-item running markers, misfire detection and catch-up.
//! - Failover: items left unfinished by a crashed instance are queued and
//!   claimed exactly once by a survivor.
//! - Clock drift check against the store before every cycle.
//! - Error handlers (`LOG`, `IGNORE`, `PROPAGATE`, or your own) and
//!   before/after listeners; item and listener failures never abort a cycle.
//! - Cycle triggering on a [`Schedule`] (fixed interval, one-off, or CRON with
//!   the `cron_schedule` feature), or by hand.
//! - Metrics snapshots ([`MetricsSnapshot`]) and `tracing` spans per cycle.
//! - Optional task-local [`ShardingContext`] access inside item bodies
//!   (`job_context` feature, on by default).
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use shardkeeper::{item_fn, JobConfiguration, JobHost, Schedule, store::MemoryCluster};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,shardkeeper=info").init();
//!     let cluster = MemoryCluster::new();
//!
//!     let host = JobHost::builder()
//!         .store(Arc::new(cluster.connect()))
//!         .max_workers(4)
//!         .build()?;
//!
//!     let config = JobConfiguration::builder("settlement", "0/10 * * * * ?", 4)
//!         .job_type("SettlementJob")
//!         .sharding_item_parameters("0=north,1=south,2=east,3=west")
//!         .failover(true)
//!         .build();
//!
//!     let job = host
//!         .setup(
//!             config,
//!             item_fn!(|ctx| {
//!                 println!("item {} ({:?})", ctx.item, ctx.item_parameter);
//!                 Ok(())
//!             }),
//!             Vec::new(),
//!         )
//!         .await?;
//!
//!     job.schedule_recurring(Schedule::FixedInterval(Duration::from_secs(10))).await?;
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     println!("{:#?}", job.metrics());
//!
//!     host.shutdown_all(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Host-wide settings live on [`JobHostBuilder`]: the store session,
//! `max_workers` (concurrently executing items across all jobs), the
//! failover queue capacity, poll intervals and the strategy and error
//! handler registries. Per-job settings live on [`JobConfiguration`] and are
//! persisted in the store at setup.

#[cfg(all(doc, feature = "job_context"))]
pub mod job_context_docs {
  //! # Accessing the sharding context (`job_context` feature)
  //!
  //! Inside an item body the current [`ShardingContext`](crate::ShardingContext)
  //! is also available task-locally:
  //!
  //! 1.  **`try_current_sharding_context() -> Option<ShardingContext>`**: `None`
  //!     outside an item body.
  //! 2.  **`sharding_context!() -> ShardingContext`**: panics outside an item body.
  //!
  //! This is useful from helpers deep in the call stack that do not receive
  //! the context argument.
}

pub mod command;
pub mod config;
pub mod election;
pub mod error;
pub mod execution;
pub mod failover;
pub mod handler;
pub mod instance;
pub mod job;
mod listener;
mod macros;
pub mod metrics;
mod orchestrator;
pub mod poll;
mod registry;
pub mod scheduler;
pub mod sharding;
pub mod storage;
pub mod store;

// --- Public Re-exports ---

pub use command::ShutdownMode;
pub use config::{JobConfiguration, JobConfigurationBuilder};
pub use error::{BuildError, ConfigError, CycleError, JobError, ShutdownError, StoreError};
pub use handler::{ChannelErrorHandler, ErrorHandlerRegistry, JobErrorHandler};
pub use instance::InstanceId;
pub use job::{BoxedItemFn, ItemResult, JobListener, Schedule, ShardingContext, ShardingContexts};
pub use metrics::MetricsSnapshot;
pub use scheduler::{JobHandle, JobHost, JobHostBuilder};
pub use sharding::strategy::{ShardingStrategy, StrategyRegistry};
pub use store::{CoordinatorStore, MemoryCluster, MemoryStore};

#[cfg(feature = "job_context")]
pub use job::context::try_current_sharding_context;
