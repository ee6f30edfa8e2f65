/// Builds a [`BoxedItemFn`](crate::job::BoxedItemFn) from a closure-like body.
///
/// The body runs inside `async move` with the item's `ShardingContext`
/// bound to the given identifier and must evaluate to
/// `Result<(), String>`. An optional setup block runs once per item before
/// the future is created; clone shared state there.
///
/// ```ignore
/// let processed = Arc::new(AtomicUsize::new(0));
/// let body = shardkeeper::item_fn! {
///     { let processed = processed.clone(); }
///     |ctx| {
///         processed.fetch_add(1, Ordering::SeqCst);
///         tracing::info!(item = ctx.item, "Processing.");
///         Ok(())
///     }
/// };
/// ```
#[macro_export]
macro_rules! item_fn {
    (
        { $($setup_stmts:stmt);* $(;)? }
        |$ctx:ident| $main_block:block
    ) => {
        Box::new(move |$ctx: $crate::job::ShardingContext| {
            $($setup_stmts;)*

            let fut = async move {
                let result: $crate::job::ItemResult = $main_block;
                result
            };

            Box::pin(fut) as std::pin::Pin<Box<dyn std::future::Future<Output = $crate::job::ItemResult> + Send + 'static>>
        }) as $crate::job::BoxedItemFn
    };

    (
        |$ctx:ident| $main_block:block
    ) => {
        Box::new(move |$ctx: $crate::job::ShardingContext| {
            let fut = async move {
                let result: $crate::job::ItemResult = $main_block;
                result
            };

            Box::pin(fut) as std::pin::Pin<Box<dyn std::future::Future<Output = $crate::job::ItemResult> + Send + 'static>>
        }) as $crate::job::BoxedItemFn
    };
}
