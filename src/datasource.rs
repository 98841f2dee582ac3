//! C9: the top-level façade applications construct — `DataSource<K>` wires
//! the connector, hook registry, statement cache, factory, pool, service and
//! reducer together behind a `NEW -> WORKING -> TERMINATED` lifecycle (spec
//! §4.9).
//!
//! Grounded on `sqlx-core/src/pool/mod.rs`'s `Pool::connect_with`/`Pool::close`
//! pair: `connect_with` validates options, builds the shared `PoolInner`, and
//! spawns the idle reaper; `close` is safe to call more than once and drains
//! everything still idle. The `NEW`/`WORKING`/`TERMINATED` states themselves
//! follow the small-state-enum style `rusty-db`'s `ConnectionState` uses for
//! its own connection lifecycle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::config::PoolConfig;
use crate::connector::Connector;
use crate::error::{Error, PoolError};
use crate::factory::ConnectionFactory;
use crate::holder::TakenConnectionInfo;
use crate::hooks::{
    ConnectionHook, GetConnectionTimeoutHook, HookRegistry, MethodInvocationHook,
    ResultSetRetrievalHook, StatementExecutionHook,
};
use crate::operations::PoolService;
use crate::pool::Pool;
use crate::proxy::ConnectionProxy;
use crate::raw::RawConnection;
use crate::reducer::Reducer;
use crate::statement_cache::StatementCache;

const NEW: u8 = 0;
const WORKING: u8 = 1;
const TERMINATED: u8 = 2;

/// Everything a started pool needs, built in one shot by [`DataSource::start`]
/// and torn down in one shot by [`DataSource::terminate`].
struct Running<K: Connector> {
    pool: Arc<Pool<K>>,
    factory: Arc<ConnectionFactory<K>>,
    service: Arc<PoolService<K>>,
    hooks: Arc<HookRegistry<K::Connection>>,
    stmt_cache: Arc<StatementCache<<K::Connection as RawConnection>::Statement>>,
    reducer: Reducer,
}

/// A `vibur` connection pool. `new()` produces a `NEW` instance that accepts
/// hook registrations; `start()` moves it to `WORKING`, after which it hands
/// out [`ConnectionProxy`]s until `terminate()` moves it to `TERMINATED`.
pub struct DataSource<K: Connector> {
    connector: Mutex<Option<K>>,
    config: Arc<PoolConfig>,
    hooks: Mutex<HookRegistry<K::Connection>>,
    state: AtomicU8,
    running: Mutex<Option<Running<K>>>,
}

impl<K: Connector> DataSource<K> {
    pub fn new(connector: K, config: PoolConfig) -> Self {
        Self {
            connector: Mutex::new(Some(connector)),
            config: Arc::new(config),
            hooks: Mutex::new(HookRegistry::default()),
            state: AtomicU8::new(NEW),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_working(&self) -> bool {
        self.state.load(Ordering::Acquire) == WORKING
    }

    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == TERMINATED
    }

    /// Register an `InitConnection` hook. Panics (via [`crate::hooks::HookList`])
    /// if called after `start()`.
    pub fn on_init_connection(&self, hook: Arc<dyn ConnectionHook<K::Connection>>) {
        self.hooks.lock().init_connection.register(hook);
    }

    pub fn on_get_connection(&self, hook: Arc<dyn ConnectionHook<K::Connection>>) {
        self.hooks.lock().get_connection.register(hook);
    }

    pub fn on_close_connection(&self, hook: Arc<dyn ConnectionHook<K::Connection>>) {
        self.hooks.lock().close_connection.register(hook);
    }

    pub fn on_destroy_connection(&self, hook: Arc<dyn ConnectionHook<K::Connection>>) {
        self.hooks.lock().destroy_connection.register(hook);
    }

    pub fn on_get_connection_timeout(&self, hook: Arc<dyn GetConnectionTimeoutHook>) {
        self.hooks.lock().get_connection_timeout.register(hook);
    }

    pub fn on_method_invocation(&self, hook: Arc<dyn MethodInvocationHook>) {
        self.hooks.lock().method_invocation.register(hook);
    }

    pub fn on_statement_execution(&self, hook: Arc<dyn StatementExecutionHook>) {
        self.hooks.lock().statement_execution.register(hook);
    }

    pub fn on_result_set_retrieval(&self, hook: Arc<dyn ResultSetRetrievalHook>) {
        self.hooks.lock().result_set_retrieval.register(hook);
    }

    /// Spec §4.9 `start`: validates the configuration, freezes the hook
    /// registry, builds the factory/pool/service/statement cache (in that
    /// order), eagerly creates `poolInitialSize` connections under
    /// `loginTimeoutInSeconds`, and spawns the background reducer. Leaves
    /// the data source `NEW` (so a caller may retry) if any step fails.
    pub async fn start(&self) -> Result<(), Error> {
        if self
            .state
            .compare_exchange(NEW, WORKING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PoolError::ConnectionInit(
                "data source already started or terminated".into(),
            )
            .into());
        }

        if let Err(e) = self.try_start().await {
            self.state.store(NEW, Ordering::Release);
            return Err(e);
        }

        info!(target: "vibur::datasource", name = %self.config.name, "pool started");
        Ok(())
    }

    async fn try_start(&self) -> Result<(), Error> {
        self.config.validate()?;

        let connector = self
            .connector
            .lock()
            .take()
            .expect("connector is only ever taken once, guarded by the NEW->WORKING transition");

        let mut hooks = std::mem::replace(&mut *self.hooks.lock(), HookRegistry::default());
        hooks.freeze();
        let hooks = Arc::new(hooks);

        let stmt_cache = Arc::new(StatementCache::new(self.config.statement_cache_max_size));
        let stmt_cache_for_destroy = stmt_cache.clone();

        let factory = Arc::new(
            ConnectionFactory::new(connector, self.config.clone(), hooks.clone())
                .with_on_destroy(Arc::new(move |id| stmt_cache_for_destroy.remove_all(id))),
        );
        let pool = Arc::new(Pool::new(self.config.clone()));

        for _ in 0..self.config.pool_initial_size {
            let holder =
                tokio::time::timeout(self.config.login_timeout(), factory.create())
                    .await
                    .map_err(|_| PoolError::Timeout(self.config.login_timeout()))??;
            pool.seed_idle(holder)?;
        }

        let service = Arc::new(PoolService::new(
            pool.clone(),
            factory.clone(),
            hooks.clone(),
            self.config.clone(),
        ));
        let reducer = Reducer::spawn(pool.clone(), factory.clone(), self.config.clone());

        *self.running.lock() = Some(Running {
            pool,
            factory,
            service,
            hooks,
            stmt_cache,
            reducer,
        });

        Ok(())
    }

    /// Spec §4.9 `terminate`: idempotent. Stops the reducer, drains and
    /// destroys every idle connection, and closes the statement cache.
    /// Connections currently checked out are returned to their
    /// `ConnectionProxy::close`/`Drop` path as usual; by default (spec §6
    /// `allowConnectionAfterTermination = false`) that path destroys them
    /// instead of restoring them to an idle queue that no longer exists.
    ///
    /// Unlike the rest of the pool's teardown, `running` itself is left in
    /// place rather than taken: the factory/connector/statement cache must
    /// stay reachable so `getConnection` can keep serving raw, non-pooled
    /// connections after termination when `allowConnectionAfterTermination`
    /// is set.
    pub async fn terminate(&self) {
        if self
            .state
            .compare_exchange(WORKING, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let (pool, factory, stmt_cache) = {
            let mut guard = self.running.lock();
            let Some(running) = guard.as_mut() else {
                return;
            };
            running.reducer.stop();
            (running.pool.clone(), running.factory.clone(), running.stmt_cache.clone())
        };

        let drained = pool.terminate();
        let count = drained.len();
        for holder in drained {
            factory.destroy(holder).await;
        }
        stmt_cache.close_all();

        info!(target: "vibur::datasource", name = %self.config.name, drained = count, "pool terminated");
    }

    /// Clones out the `Arc`s a borrow needs and releases the lock before
    /// returning, so no `parking_lot::MutexGuard` (which is not `Send`) is
    /// ever held across an `.await` point.
    #[allow(clippy::type_complexity)]
    fn snapshot(
        &self,
    ) -> Result<
        (
            Arc<PoolService<K>>,
            Arc<HookRegistry<K::Connection>>,
            Arc<StatementCache<<K::Connection as RawConnection>::Statement>>,
        ),
        Error,
    > {
        match self.running.lock().as_ref() {
            Some(r) => {
                if self.is_terminated() && !self.config.allow_connection_after_termination {
                    return Err(PoolError::Closed.into());
                }
                Ok((r.service.clone(), r.hooks.clone(), r.stmt_cache.clone()))
            }
            None => Err(PoolError::NotStarted.into()),
        }
    }

    /// Spec §4.5 `getConnection`: borrow a connection and wrap it in the
    /// proxy layer applications actually use. Once `terminate()` has run,
    /// this only succeeds at all when `allowConnectionAfterTermination` is
    /// set, and then serves a raw, non-pooled connection (spec §4.9)
    /// instead of drawing from an idle queue that no longer exists.
    pub async fn get_connection(
        &self,
        timeout: Option<Duration>,
    ) -> Result<ConnectionProxy<K>, Error> {
        let (service, hooks, stmt_cache) = self.snapshot()?;

        if self.is_terminated() {
            let holder = service.borrow_unpooled(timeout, None).await?;
            return Ok(ConnectionProxy::new(
                holder,
                service,
                hooks,
                self.config.clone(),
                stmt_cache,
                false,
            ));
        }

        let holder = service.borrow(timeout).await?;
        Ok(ConnectionProxy::new(
            holder,
            service,
            hooks,
            self.config.clone(),
            stmt_cache,
            true,
        ))
    }

    /// Spec §4.1c/§4.9: borrow a connection created under a caller-supplied
    /// `{user, password}` rather than the connector's default identity.
    /// Always a raw, non-pooled connection — a connection established under
    /// a credential override must never be handed to a later default-
    /// credential caller, so it cannot go through the shared idle queue.
    pub async fn get_connection_with_credentials(
        &self,
        timeout: Option<Duration>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<ConnectionProxy<K>, Error> {
        let (service, hooks, stmt_cache) = self.snapshot()?;
        let holder = service
            .borrow_unpooled(timeout, Some((user.into(), password.into())))
            .await?;
        Ok(ConnectionProxy::new(
            holder,
            service,
            hooks,
            self.config.clone(),
            stmt_cache,
            false,
        ))
    }

    /// Spec §4.8/§4.9 C9 `severConnection`: marks `connection_id` for forced
    /// invalidation, effective the next time its `ConnectionProxy` is
    /// touched (including by `close`/`abort` themselves). Idempotent: a
    /// connection already severed, already closed, or never taken is simply
    /// a no-op.
    pub fn sever_connection(&self, connection_id: u64) {
        if let Some(r) = self.running.lock().as_ref() {
            r.service.sever(connection_id);
        }
    }

    /// Spec §4.9 `getTakenConnections`: point-in-time snapshot of every
    /// checked-out connection. Empty unless `poolEnableConnectionTracking`
    /// is set.
    pub fn taken_connections(&self) -> Vec<TakenConnectionInfo> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.service.taken_connections())
            .unwrap_or_default()
    }

    /// Spec §4.9 `getTakenConnectionsStackTraces`.
    pub fn taken_connections_stack_traces(&self) -> Vec<String> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.service.taken_connections_stack_traces())
            .unwrap_or_default()
    }

    pub fn idle_len(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.pool.idle_len())
            .unwrap_or(0)
    }

    pub fn total_len(&self) -> u32 {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.pool.total_len())
            .unwrap_or(0)
    }
}

impl<K: Connector> Drop for DataSource<K> {
    /// Best-effort: stops the reducer if the application never called
    /// `terminate()`. Idle connections are simply dropped along with the
    /// pool; nothing further can observe them.
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().as_mut() {
            running.reducer.stop();
        }
    }
}
