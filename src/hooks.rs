//! C2: ordered, typed collections of lifecycle and invocation callbacks.
//!
//! Grounded on `sqlx-core/src/pool/options.rs`'s `after_connect`/
//! `before_acquire`/`after_release` `Arc<dyn Fn(...) -> BoxFuture<...>>`
//! callbacks: each hook list here is an `Arc<[...]>` snapshot, rebuilt (not
//! mutated in place) whenever a hook is registered, which is only allowed
//! before `start()` (spec §4.2). Readers after `start()` just clone the
//! `Arc`, giving lock-free reads of a frozen registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A connection-lifecycle hook: `InitConnection`, `GetConnection`,
/// `CloseConnection`, or `DestroyConnection` (spec §4.2).
pub trait ConnectionHook<C>: Send + Sync + 'static {
    fn call<'a>(&'a self, conn: &'a mut C, elapsed: Duration) -> BoxFuture<'a, Result<(), Error>>;
}

impl<C, F> ConnectionHook<C> for F
where
    F: for<'a> Fn(&'a mut C, Duration) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, conn: &'a mut C, elapsed: Duration) -> BoxFuture<'a, Result<(), Error>> {
        self(conn, elapsed)
    }
}

/// Fired when `get_connection` exceeds `connectionTimeoutInMs` (spec §4.2).
pub trait GetConnectionTimeoutHook: Send + Sync + 'static {
    fn call(&self, waited: Duration);
}

impl<F> GetConnectionTimeoutHook for F
where
    F: Fn(Duration) + Send + Sync + 'static,
{
    fn call(&self, waited: Duration) {
        self(waited)
    }
}

/// `StatementExecution`: fires after a statement runs, with its SQL,
/// parameters, elapsed time and outcome (spec §4.2 — used for the
/// `logQueryExecutionLongerThanMs` style of observation). Simplified from an
/// around-style hook with a `proceed` continuation: a continuation borrowing
/// the live raw connection can't be expressed as the `BoxFuture<'static, _>`
/// a reusable hook object needs, so this crate reports timing/outcome after
/// the fact instead of wrapping the call (see DESIGN.md).
pub trait StatementExecutionHook: Send + Sync + 'static {
    fn call(&self, sql: &str, params: &[String], elapsed: Duration, succeeded: bool);
}

impl<F> StatementExecutionHook for F
where
    F: Fn(&str, &[String], Duration, bool) + Send + Sync + 'static,
{
    fn call(&self, sql: &str, params: &[String], elapsed: Duration, succeeded: bool) {
        self(sql, params, elapsed, succeeded)
    }
}

/// `MethodInvocation`: fires before every intercepted proxy call.
pub trait MethodInvocationHook: Send + Sync + 'static {
    fn call(&self, method: &str);
}

impl<F> MethodInvocationHook for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn call(&self, method: &str) {
        self(method)
    }
}

/// `ResultSetRetrieval`: fires on `ResultSet::close` with the row count and
/// elapsed time since the first `next()`.
pub trait ResultSetRetrievalHook: Send + Sync + 'static {
    fn call(&self, row_count: u64, elapsed: Duration);
}

impl<F> ResultSetRetrievalHook for F
where
    F: Fn(u64, Duration) + Send + Sync + 'static,
{
    fn call(&self, row_count: u64, elapsed: Duration) {
        self(row_count, elapsed)
    }
}

/// Copy-on-write list of hooks of one kind. Registration before `start()`
/// replaces the `Arc`; after `start()`, registration is refused.
pub struct HookList<H: ?Sized> {
    hooks: Arc<Vec<Arc<H>>>,
    frozen: bool,
}

impl<H: ?Sized> Default for HookList<H> {
    fn default() -> Self {
        Self {
            hooks: Arc::new(Vec::new()),
            frozen: false,
        }
    }
}

impl<H: ?Sized> HookList<H> {
    pub fn register(&mut self, hook: Arc<H>) {
        assert!(
            !self.frozen,
            "hooks can only be registered before the pool is started"
        );
        let mut hooks = (*self.hooks).clone();
        hooks.push(hook);
        self.hooks = Arc::new(hooks);
    }

    /// Freeze the registry; called once by `start()`.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<H>>> {
        Arc::clone(&self.hooks)
    }
}

/// All hook registries owned by a [`crate::DataSource`] / [`crate::factory::ConnectionFactory`].
pub struct HookRegistry<C> {
    pub init_connection: HookList<dyn ConnectionHook<C>>,
    pub get_connection: HookList<dyn ConnectionHook<C>>,
    pub close_connection: HookList<dyn ConnectionHook<C>>,
    pub destroy_connection: HookList<dyn ConnectionHook<C>>,
    pub get_connection_timeout: HookList<dyn GetConnectionTimeoutHook>,
    pub method_invocation: HookList<dyn MethodInvocationHook>,
    pub statement_execution: HookList<dyn StatementExecutionHook>,
    pub result_set_retrieval: HookList<dyn ResultSetRetrievalHook>,
}

impl<C> Default for HookRegistry<C> {
    fn default() -> Self {
        Self {
            init_connection: HookList::default(),
            get_connection: HookList::default(),
            close_connection: HookList::default(),
            destroy_connection: HookList::default(),
            get_connection_timeout: HookList::default(),
            method_invocation: HookList::default(),
            statement_execution: HookList::default(),
            result_set_retrieval: HookList::default(),
        }
    }
}

impl<C> HookRegistry<C> {
    /// Freezes every list in the registry; called once by `start()`.
    pub fn freeze(&mut self) {
        self.init_connection.freeze();
        self.get_connection.freeze();
        self.close_connection.freeze();
        self.destroy_connection.freeze();
        self.get_connection_timeout.freeze();
        self.method_invocation.freeze();
        self.statement_execution.freeze();
        self.result_set_retrieval.freeze();
    }
}

/// Runs a chain of [`ConnectionHook`]s in registration order. A hook error
/// aborts the remaining hooks of that kind (spec §4.2).
pub async fn run_connection_hooks<C>(
    hooks: &Arc<Vec<Arc<dyn ConnectionHook<C>>>>,
    conn: &mut C,
    elapsed: Duration,
) -> Result<(), Error> {
    for hook in hooks.iter() {
        hook.call(conn, elapsed).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn hooks_run_in_registration_order_and_abort_on_error() {
        let order = Arc::new(std::sync::Mutex::new(Vec::<u32>::new()));
        let mut list: HookList<dyn ConnectionHook<()>> = HookList::default();

        let o1 = order.clone();
        list.register(Arc::new(move |_: &mut (), _: Duration| -> BoxFuture<'_, Result<(), Error>> {
            let o1 = o1.clone();
            Box::pin(async move {
                o1.lock().unwrap().push(1);
                Ok(())
            })
        }));

        let o2 = order.clone();
        list.register(Arc::new(move |_: &mut (), _: Duration| -> BoxFuture<'_, Result<(), Error>> {
            let o2 = o2.clone();
            Box::pin(async move {
                o2.lock().unwrap().push(2);
                Err(Error::Pool(crate::error::PoolError::Closed4Use))
            })
        }));

        let o3 = order.clone();
        list.register(Arc::new(move |_: &mut (), _: Duration| -> BoxFuture<'_, Result<(), Error>> {
            let o3 = o3.clone();
            Box::pin(async move {
                o3.lock().unwrap().push(3);
                Ok(())
            })
        }));

        let mut conn = ();
        let snapshot = list.snapshot();
        let result = run_connection_hooks(&snapshot, &mut conn, Duration::ZERO).await;
        assert!(result.is_err());
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    #[should_panic]
    fn registering_after_freeze_panics() {
        let mut list: HookList<dyn MethodInvocationHook> = HookList::default();
        list.freeze();
        let count = Arc::new(AtomicUsize::new(0));
        list.register(Arc::new(move |_: &str| {
            count.fetch_add(1, Ordering::Relaxed);
        }));
    }
}
