//! C7: the borrow/restore facade that ties the pool primitive (C5), the
//! connection factory (C4) and the hook registry (C2) together into the
//! behavior spec §4.5/§4.6 describe as `getConnection`/`restore`.
//!
//! Grounded on `sqlx-core/src/pool/mod.rs`'s `Pool::acquire`, which has the
//! same shape: loop trying the idle queue, falling back to a permitted
//! `connect`, re-looping past stale/dead connections, all bounded by one
//! deadline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::config::PoolConfig;
use crate::connector::Connector;
use crate::error::{Error, PoolError};
use crate::factory::ConnectionFactory;
use crate::holder::{ConnHolder, TakenConnectionInfo};
use crate::hooks::HookRegistry;
use crate::pool::{Acquired, Pool};

pub struct PoolService<K: Connector> {
    pool: Arc<Pool<K>>,
    factory: Arc<ConnectionFactory<K>>,
    hooks: Arc<HookRegistry<K::Connection>>,
    config: Arc<PoolConfig>,
    /// Live snapshots of every checked-out connection, keyed by connection
    /// id; populated only when `poolEnableConnectionTracking` is set (spec
    /// §3, §4.9).
    taken: Mutex<HashMap<u64, TakenConnectionInfo>>,
    /// Connection ids marked by `severConnection` (spec §4.8), consumed the
    /// next time their `ConnectionProxy` is touched.
    severed: Mutex<HashSet<u64>>,
}

impl<K: Connector> PoolService<K> {
    pub fn new(
        pool: Arc<Pool<K>>,
        factory: Arc<ConnectionFactory<K>>,
        hooks: Arc<HookRegistry<K::Connection>>,
        config: Arc<PoolConfig>,
    ) -> Self {
        Self {
            pool,
            factory,
            hooks,
            config,
            taken: Mutex::new(HashMap::new()),
            severed: Mutex::new(HashSet::new()),
        }
    }

    /// Spec §4.5 `getConnection`: returns a ready-to-use connection within
    /// `timeout` (or the configured `connectionTimeoutInMs` if `None`),
    /// transparently skipping past idle connections that turn out to be
    /// stale or fail their `GetConnection` hooks.
    pub async fn borrow(&self, timeout: Option<Duration>) -> Result<ConnHolder<K::Connection>, Error> {
        let wait_start = Instant::now();
        let deadline = wait_start + timeout.unwrap_or_else(|| self.config.connection_timeout());

        loop {
            let acquired = match self.pool.acquire(deadline).await {
                Ok(a) => a,
                Err(e) => {
                    if matches!(e, Error::Pool(PoolError::Timeout(_))) {
                        self.on_timeout(wait_start.elapsed());
                    }
                    return Err(e);
                }
            };

            let mut holder = match acquired {
                Acquired::Idle(holder) => holder,
                Acquired::Permit(permit) => match self.factory.create_with(None).await {
                    Ok(holder) => {
                        permit.fulfill();
                        holder
                    }
                    Err(e) => {
                        // permit drops here, freeing the slot for the next waiter
                        if Instant::now() >= deadline {
                            self.on_timeout(wait_start.elapsed());
                            return Err(PoolError::Timeout(self.config.connection_timeout()).into());
                        }
                        warn!(target: "vibur::pool::operations", error = %e, "connection create failed while borrowing");
                        continue;
                    }
                },
            };

            if self.factory.is_stale(&holder) {
                self.pool.release_slot();
                self.factory.destroy(holder).await;
                continue;
            }

            if let Err(e) = self.factory.ready_to_take(&mut holder).await {
                warn!(target: "vibur::pool::operations", error = %e, "GetConnection hook rejected idle connection");
                self.pool.release_slot();
                self.factory.destroy(holder).await;
                continue;
            }

            holder.mark_taken(self.config.log_all_stack_traces_on_timeout);
            self.register_taken(&holder);
            return Ok(holder);
        }
    }

    /// Spec §4.1c/§4.9: build a connection outside the shared idle queue
    /// and size counter entirely, either because the caller supplied a
    /// credential override (so it can never be handed a connection
    /// established under a different identity) or because it is serving a
    /// connection after `terminate()` under `allowConnectionAfterTermination`.
    pub async fn borrow_unpooled(
        &self,
        timeout: Option<Duration>,
        credentials: Option<(String, String)>,
    ) -> Result<ConnHolder<K::Connection>, Error> {
        let wait_start = Instant::now();
        let bound = timeout.unwrap_or_else(|| self.config.connection_timeout());

        let mut holder = match tokio::time::timeout(bound, self.factory.create_with(credentials)).await {
            Ok(result) => result?,
            Err(_) => {
                self.on_timeout(wait_start.elapsed());
                return Err(PoolError::Timeout(bound).into());
            }
        };

        self.factory.ready_to_take(&mut holder).await?;
        holder.mark_taken(self.config.log_all_stack_traces_on_timeout);
        self.register_taken(&holder);
        Ok(holder)
    }

    fn register_taken(&self, holder: &ConnHolder<K::Connection>) {
        if !self.config.pool_enable_connection_tracking {
            return;
        }
        if let Some(tracking) = &holder.tracking {
            self.taken
                .lock()
                .insert(holder.id.as_u64(), TakenConnectionInfo::from((holder.id.as_u64(), tracking)));
        }
    }

    fn on_timeout(&self, waited: Duration) {
        for hook in self.hooks.get_connection_timeout.snapshot().iter() {
            hook.call(waited);
        }
        if self.config.log_taken_connections_on_timeout {
            self.log_taken_connections();
        }
    }

    fn log_taken_connections(&self) {
        let taken = self.taken.lock();
        if taken.is_empty() {
            return;
        }
        warn!(
            target: "vibur::pool::operations",
            count = taken.len(),
            "connection acquire timed out; dumping currently taken connections"
        );
        for info in taken.values() {
            warn!(
                target: "vibur::pool::operations",
                connection_id = info.connection_id,
                thread = %info.thread_name,
                taken_for_ms = info.taken_at.elapsed().as_millis() as u64,
                idle_since_access_ms = info.last_access().elapsed().as_millis() as u64,
                stack_trace = info.stack_trace.as_deref().unwrap_or("<not captured>"),
                "taken connection"
            );
        }
    }

    /// Spec §4.9 `getTakenConnections`: point-in-time snapshot of every
    /// connection currently checked out. Empty unless
    /// `poolEnableConnectionTracking` is set.
    pub fn taken_connections(&self) -> Vec<TakenConnectionInfo> {
        self.taken.lock().values().cloned().collect()
    }

    /// Spec §4.9 `getTakenConnectionsStackTraces`: just the captured stack
    /// traces (only present when `logAllStackTracesOnTimeout` is set).
    pub fn taken_connections_stack_traces(&self) -> Vec<String> {
        self.taken
            .lock()
            .values()
            .filter_map(|info| info.stack_trace.clone())
            .collect()
    }

    /// Marks `connection_id` for forced invalidation the next time its
    /// `ConnectionProxy` is touched (spec §4.8 `severConnection`).
    /// Idempotent: severing an id more than once, or one that is no longer
    /// checked out, is a no-op.
    pub fn sever(&self, connection_id: u64) {
        self.severed.lock().insert(connection_id);
    }

    /// Consumes the sever mark for `connection_id`, if any, so a proxy only
    /// force-closes once per `severConnection` call.
    pub fn take_severed(&self, connection_id: u64) -> bool {
        self.severed.lock().remove(&connection_id)
    }

    /// Spec §4.6 `restore`: returns a healthy connection to idle, or
    /// permanently removes it — and, if `critical` is set (the session saw
    /// an error whose SQLSTATE is in `criticalSQLStates`), bumps the
    /// factory's generation and drains every other idle connection from the
    /// now-stale generation.
    pub async fn restore(&self, mut holder: ConnHolder<K::Connection>, valid: bool, critical: bool) {
        self.taken.lock().remove(&holder.id.as_u64());

        // A pool that was terminated while this connection was checked out
        // has no idle queue left to release into; routing it through
        // `release_idle` here would have the pool silently drop the holder
        // without ever closing the raw connection.
        if !valid || self.pool.is_terminated() {
            let stale_version = holder.version;
            self.pool.release_slot();
            self.factory.destroy(holder).await;

            if critical {
                self.roll_generation(stale_version).await;
            }
            return;
        }

        if self.factory.is_stale(&holder) {
            self.pool.release_slot();
            self.factory.destroy(holder).await;
            return;
        }

        if let Err(e) = self.factory.ready_to_restore(&mut holder).await {
            warn!(target: "vibur::pool::operations", error = %e, "CloseConnection hook failed on restore");
            self.pool.release_slot();
            self.factory.destroy(holder).await;
            return;
        }

        holder.mark_restored();
        self.pool.release_idle(holder);
    }

    /// Counterpart to `restore` for a connection obtained via
    /// `borrow_unpooled`: it never occupied a pool slot or idle queue, so
    /// it is simply run through its close-out hooks and destroyed, win or
    /// lose. `critical` still triggers the same generation rollover a
    /// pooled connection's failure would.
    pub async fn release_unpooled(&self, holder: ConnHolder<K::Connection>, critical: bool) {
        let stale_version = holder.version;
        self.taken.lock().remove(&holder.id.as_u64());
        self.factory.destroy(holder).await;

        if critical {
            self.roll_generation(stale_version).await;
        }
    }

    /// Spec §4.6: atomically (CAS) advance the factory's generation past
    /// `observed_stale_version`, then drain and destroy every idle
    /// connection still tagged with a stale generation. Concurrent callers
    /// reporting the same critical failure only perform the bump once; the
    /// later ones observe the CAS fail and skip straight to draining, which
    /// is itself idempotent (an already-drained queue just yields nothing).
    async fn roll_generation(&self, observed_stale_version: u64) {
        self.factory.bump_version(observed_stale_version);
        let current = self.factory.version();
        let stale = self.pool.drain_stale(current);
        if !stale.is_empty() {
            warn!(
                target: "vibur::pool::operations",
                count = stale.len(),
                "draining connection generation after critical failure"
            );
        }
        for holder in stale {
            self.pool.release_slot();
            self.factory.destroy(holder).await;
        }
    }

    /// Whether `error` carries one of `criticalSQLStates` (spec §4.6),
    /// for callers (the proxy layer) deciding what to pass to `restore`.
    pub fn is_critical(&self, error: &Error) -> bool {
        error.any_sql_state_in(self.config.critical_sql_states.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;
    use crate::raw::test_support::NullConnection;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service(max_size: u32) -> PoolService<fn(crate::connector::ConnectMeta) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<NullConnection, Error>> + Send>>> {
        let config = Arc::new(PoolConfig::builder().pool_max_size(max_size).build().unwrap());
        let pool = Arc::new(Pool::new(config.clone()));
        let connect_fn: fn(crate::connector::ConnectMeta) -> _ =
            |_m| Box::pin(async { Ok(NullConnection) });
        let factory = Arc::new(ConnectionFactory::new(
            connect_fn,
            config.clone(),
            Arc::new(HookRegistry::default()),
        ));
        PoolService::new(pool, factory, Arc::new(HookRegistry::default()), config)
    }

    #[tokio::test]
    async fn borrow_creates_then_reuses_on_restore() {
        let svc = service(2);
        let holder = svc.borrow(None).await.unwrap();
        let id = holder.id;
        svc.restore(holder, true, false).await;

        let holder2 = svc.borrow(None).await.unwrap();
        assert_eq!(holder2.id, id, "restored connection should be reused, not recreated");
    }

    #[tokio::test]
    async fn borrow_times_out_when_pool_exhausted() {
        let svc = service(1);
        let _holder = svc.borrow(None).await.unwrap();
        let err = svc
            .borrow(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::Timeout(_))));
    }

    #[derive(Debug)]
    struct CriticalDbError;
    impl std::fmt::Display for CriticalDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "connection failure")
        }
    }
    impl std::error::Error for CriticalDbError {}
    impl DatabaseError for CriticalDbError {
        fn message(&self) -> &str {
            "connection failure"
        }
        fn sql_state(&self) -> Option<&str> {
            Some("08001")
        }
    }

    #[tokio::test]
    async fn critical_error_drains_other_idle_connections() {
        let svc = service(3);
        let h1 = svc.borrow(None).await.unwrap();
        let h2 = svc.borrow(None).await.unwrap();
        let h3 = svc.borrow(None).await.unwrap();

        svc.restore(h2, true, false).await;
        svc.restore(h3, true, false).await;
        assert_eq!(svc.pool.idle_len(), 2);

        let err = Error::Database(Box::new(CriticalDbError));
        assert!(svc.is_critical(&err));
        svc.restore(h1, false, true).await;

        assert_eq!(svc.pool.idle_len(), 0, "critical failure should drain stale idle connections");
        assert_eq!(svc.factory.version(), 1);
    }

    #[tokio::test]
    async fn get_connection_timeout_hook_fires_on_timeout() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let config = Arc::new(PoolConfig::builder().pool_max_size(1).build().unwrap());
        let pool = Arc::new(Pool::new(config.clone()));
        let connect_fn: fn(crate::connector::ConnectMeta) -> _ =
            |_m| Box::pin(async { Ok(NullConnection) });
        let factory = Arc::new(ConnectionFactory::new(
            connect_fn,
            config.clone(),
            Arc::new(HookRegistry::default()),
        ));
        let mut hooks: HookRegistry<NullConnection> = HookRegistry::default();
        hooks.get_connection_timeout.register(Arc::new(move |_: Duration| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        let svc = PoolService::new(pool, factory, Arc::new(hooks), config);

        let _holder = svc.borrow(None).await.unwrap();
        let _ = svc.borrow(Some(Duration::from_millis(10))).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
