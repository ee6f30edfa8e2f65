use super::ShardingContext;

tokio::task_local! {
    /// The context of the sharding item executing on the current task.
    /// Set around every item body when the `job_context` feature is enabled.
    pub static CURRENT_SHARDING_CONTEXT: ShardingContext;
}

/// Returns the current item's context, or `None` outside an item body.
pub fn try_current_sharding_context() -> Option<ShardingContext> {
  CURRENT_SHARDING_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current [`ShardingContext`](crate::job::ShardingContext).
///
/// # Panics
/// Panics outside an item body. Use `try_current_sharding_context()` for
/// optional access.
#[macro_export]
macro_rules! sharding_context {
  () => {
    $crate::job::context::CURRENT_SHARDING_CONTEXT.with(|ctx| ctx.clone())
  };
}
