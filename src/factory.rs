//! C4: versioned connection factory — creates raw connections, runs the
//! init-connection and destroy-connection hooks around them, and tracks a
//! generation counter bumped whenever a critical failure is observed
//! (spec §4.4, §4.6).
//!
//! Grounded on `sqlx-core/src/pool/connect.rs`'s `connect` retry loop, but
//! replacing its exponential `ease_off` backoff with the spec's fixed
//! `acquireRetryDelayInMs` sleep between `acquireRetryAttempts` tries
//! (recorded as a deliberate deviation in DESIGN.md).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{PoolConfig, IS_VALID};
use crate::connector::{ConnectMeta, Connector};
use crate::error::{Error, PoolError};
use crate::holder::ConnHolder;
use crate::hooks::{run_connection_hooks, ConnectionHook, HookRegistry};

/// Creates, validates and destroys raw connections for one pool, under a
/// single current generation ("version").
pub struct ConnectionFactory<K: Connector> {
    connector: K,
    config: Arc<PoolConfig>,
    hooks: Arc<HookRegistry<K::Connection>>,
    version: AtomicU64,
    /// Notified with a connection's id whenever it is destroyed, so the
    /// statement cache (C3, shared across the whole pool rather than
    /// per-connection) can drop that connection's entries.
    on_destroy: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl<K: Connector> ConnectionFactory<K> {
    pub fn new(connector: K, config: Arc<PoolConfig>, hooks: Arc<HookRegistry<K::Connection>>) -> Self {
        Self {
            connector,
            config,
            hooks,
            version: AtomicU64::new(0),
            on_destroy: None,
        }
    }

    pub fn with_on_destroy(mut self, on_destroy: Arc<dyn Fn(u64) + Send + Sync>) -> Self {
        self.on_destroy = Some(on_destroy);
        self
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Bump the generation counter via CAS so concurrent critical-failure
    /// reports only invalidate the generation once (spec §4.6: "idempotent
    /// under concurrent restores").
    pub fn bump_version(&self, observed: u64) -> bool {
        self.version
            .compare_exchange(observed, observed + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Spec §4.4 `create()`: connect, then run `InitConnection` hooks
    /// (including `initSql`, modeled as an ordinary init hook per
    /// SPEC_FULL.md's resolution of the initSql/hook-ordering question),
    /// retrying the whole attempt up to `acquireRetryAttempts` times with a
    /// fixed delay between tries. If a raw connection was created on an
    /// attempt whose init hooks then failed, destroy hooks always run on it
    /// before the attempt is abandoned.
    pub async fn create(&self) -> Result<ConnHolder<K::Connection>, Error> {
        self.create_with(None).await
    }

    /// Same as [`Self::create`], overriding the connector's identity for
    /// this one connection with a caller-supplied `{user, password}` (spec
    /// §4.1c). Honored only by connectors that read `ConnectMeta::credentials`
    /// (currently [`crate::connector::ExternalConnector`]).
    pub async fn create_with(
        &self,
        credentials: Option<(String, String)>,
    ) -> Result<ConnHolder<K::Connection>, Error> {
        let version = self.version();
        let start = Instant::now();
        let mut last_err = None;

        for attempt in 0..=self.config.acquire_retry_attempts {
            let meta = ConnectMeta {
                start,
                attempt,
                credentials: credentials.clone(),
            };
            match self.try_create_once(meta, version).await {
                Ok(holder) => return Ok(holder),
                Err(e) => {
                    warn!(
                        target: "vibur::pool::factory",
                        attempt,
                        error = %e,
                        "connection creation attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < self.config.acquire_retry_attempts {
                        tokio::time::sleep(self.config.acquire_retry_delay()).await;
                    }
                }
            }
        }

        Err(PoolError::ConnectionInit(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        )
        .into())
    }

    async fn try_create_once(
        &self,
        meta: ConnectMeta,
        version: u64,
    ) -> Result<ConnHolder<K::Connection>, Error> {
        let mut raw = self.connector.connect(meta).await?;

        let init_hooks = self.hooks.init_connection.snapshot();
        let init_result = match run_connection_hooks(&init_hooks, &mut raw, std::time::Duration::ZERO).await {
            Ok(()) => self.apply_defaults(&mut raw).await,
            Err(e) => Err(e),
        };
        if let Err(e) = init_result {
            let destroy_hooks = self.hooks.destroy_connection.snapshot();
            let _ = run_connection_hooks(&destroy_hooks, &mut raw, std::time::Duration::ZERO).await;
            let _ = raw.close().await;
            return Err(e);
        }

        debug!(target: "vibur::pool::factory", "created new connection");
        Ok(ConnHolder::new(raw, version))
    }

    /// Spec §4.4 `InitConnection`/`readyToRestore`: apply the configured
    /// connection defaults (`defaultAutoCommit`/`defaultReadOnly`/
    /// `defaultTransactionIsolation`/`defaultCatalog`). Unset options are
    /// left alone rather than forced to a value the caller never asked for.
    async fn apply_defaults(&self, raw: &mut K::Connection) -> Result<(), Error> {
        if let Some(auto_commit) = self.config.default_auto_commit {
            raw.set_auto_commit(auto_commit).await?;
        }
        if let Some(read_only) = self.config.default_read_only {
            raw.set_read_only(read_only).await?;
        }
        if let Some(level) = self.config.default_transaction_isolation {
            raw.set_transaction_isolation(level).await?;
        }
        if let Some(catalog) = &self.config.default_catalog {
            raw.set_catalog(catalog).await?;
        }
        Ok(())
    }

    /// Spec §4.4 `readyToTake`: validates a connection that has sat idle past
    /// `connectionIdleLimitInSeconds` (if configured), then runs the
    /// `GetConnection` hooks before it is handed to application code. A
    /// validation failure never surfaces to the caller — it only invalidates
    /// this holder (spec §7 error kind 3), so `operations::PoolService`
    /// treats any `Err` from here the same way it treats a failed hook:
    /// destroy and try the next idle connection or create a fresh one.
    pub async fn ready_to_take(&self, holder: &mut ConnHolder<K::Connection>) -> Result<(), Error> {
        if self.needs_validation(holder) {
            self.validate(holder).await?;
        }
        let hooks = self.hooks.get_connection.snapshot();
        run_connection_hooks(&hooks, &mut holder.raw, holder.idle_for()).await
    }

    /// Spec §8 boundary behavior: a negative `connectionIdleLimitInSeconds`
    /// disables validation entirely; zero validates on every take.
    fn needs_validation(&self, holder: &ConnHolder<K::Connection>) -> bool {
        if self.config.test_connection_query.is_none() {
            return false;
        }
        let limit_secs = self.config.connection_idle_limit_secs;
        if limit_secs < 0 {
            return false;
        }
        holder.idle_for() >= Duration::from_secs(limit_secs as u64)
    }

    /// Runs `testConnectionQuery` (or the driver's native `isValid` probe for
    /// the `isValid` sentinel) under `validateTimeoutInSeconds`, bounded so a
    /// hung driver call can't stall a borrower indefinitely.
    async fn validate(&self, holder: &mut ConnHolder<K::Connection>) -> Result<(), Error> {
        let query = self
            .config
            .test_connection_query
            .as_deref()
            .expect("needs_validation already checked this is Some");
        let timeout = self.config.validate_timeout();

        let healthy = if query == IS_VALID {
            matches!(
                tokio::time::timeout(timeout, holder.raw.is_valid(timeout)).await,
                Ok(Ok(true))
            )
        } else {
            matches!(
                tokio::time::timeout(timeout, holder.raw.execute_sql(query)).await,
                Ok(Ok(()))
            )
        };

        if healthy {
            Ok(())
        } else {
            Err(PoolError::ConnectionInit("connection failed idle validation".into()).into())
        }
    }

    /// Spec §4.4 `readyToRestore`: runs the `CloseConnection` hooks, then
    /// (when configured) resets the connection defaults and clears any
    /// accumulated SQL warnings before a connection goes back to the idle
    /// queue.
    pub async fn ready_to_restore(&self, holder: &mut ConnHolder<K::Connection>) -> Result<(), Error> {
        let hooks = self.hooks.close_connection.snapshot();
        run_connection_hooks(&hooks, &mut holder.raw, std::time::Duration::ZERO).await?;

        if self.config.reset_defaults_after_use {
            self.apply_defaults(&mut holder.raw).await?;
        }
        if self.config.clear_sql_warnings {
            holder.raw.clear_warnings().await?;
        }
        Ok(())
    }

    /// Spec §4.4 `destroy()`: always runs the `DestroyConnection` hooks and
    /// quietly closes the raw connection, best-effort (errors are logged,
    /// never propagated — there is no caller left to hand them to).
    pub async fn destroy(&self, mut holder: ConnHolder<K::Connection>) {
        let hooks = self.hooks.destroy_connection.snapshot();
        if let Err(e) = run_connection_hooks(&hooks, &mut holder.raw, std::time::Duration::ZERO).await {
            warn!(target: "vibur::pool::factory", error = %e, "destroy hook failed");
        }
        if let Err(e) = holder.raw.close().await {
            warn!(target: "vibur::pool::factory", error = %e, "closing a destroyed connection failed");
        }
        if let Some(on_destroy) = &self.on_destroy {
            on_destroy(holder.id.as_u64());
        }
    }

    /// Whether `holder` belongs to a generation older than the factory's
    /// current one (spec §4.6): such connections are drained rather than
    /// returned to service.
    pub fn is_stale(&self, holder: &ConnHolder<K::Connection>) -> bool {
        holder.version != self.version()
    }
}
