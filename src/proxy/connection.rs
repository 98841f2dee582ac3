//! C8: the `Connection` proxy — the spec §4/§7 object application code
//! actually holds. Intercepts every call to fire the `MethodInvocation`
//! hook and update `lastAccessNanoTime`, enforces the closed-state machine
//! (any call after `close`/`abort` fails with `VI004`), and on close hands
//! the underlying raw connection back to [`crate::operations::PoolService`].
//!
//! Grounded on `sqlx-core`'s `PoolConnection<DB>` — a `Deref`/`DerefMut`
//! wrapper around a live connection that returns it to the pool on `Drop`.
//! This proxy goes further per spec §4.8 (explicit `close`/`abort`,
//! `isClosed`, wrapper unwrapping) since those are first-class operations
//! here, not just a `Drop` side effect — though `Drop` still covers the
//! case where the application forgets to close explicitly.

use std::any::Any;
use std::sync::Arc;

use crate::config::PoolConfig;
use crate::connector::Connector;
use crate::error::{Error, PoolError};
use crate::holder::ConnHolder;
use crate::hooks::HookRegistry;
use crate::operations::PoolService;
use crate::raw::RawConnection;
use crate::statement_cache::{StatementCache, StatementKey, TakeResult};

use super::result_set::ResultSetProxy;
use super::statement::StatementProxy;

pub struct ConnectionProxy<K: Connector> {
    holder: Option<ConnHolder<K::Connection>>,
    service: Arc<PoolService<K>>,
    hooks: Arc<HookRegistry<K::Connection>>,
    config: Arc<PoolConfig>,
    stmt_cache: Arc<StatementCache<<K::Connection as RawConnection>::Statement>>,
    had_error: bool,
    had_critical_error: bool,
    /// `false` for a connection obtained outside the shared pool (a
    /// credentialed borrow, or one served after `terminate()` under
    /// `allowConnectionAfterTermination`, spec §4.1c/§4.9): such a
    /// connection is always destroyed on close/abort/drop rather than
    /// returned to the idle queue.
    pooled: bool,
}

impl<K: Connector> ConnectionProxy<K> {
    pub(crate) fn new(
        holder: ConnHolder<K::Connection>,
        service: Arc<PoolService<K>>,
        hooks: Arc<HookRegistry<K::Connection>>,
        config: Arc<PoolConfig>,
        stmt_cache: Arc<StatementCache<<K::Connection as RawConnection>::Statement>>,
        pooled: bool,
    ) -> Self {
        Self {
            holder: Some(holder),
            service,
            hooks,
            config,
            stmt_cache,
            had_error: false,
            had_critical_error: false,
            pooled,
        }
    }

    fn fire_invocation(&mut self, method: &str) {
        for hook in self.hooks.method_invocation.snapshot().iter() {
            hook.call(method);
        }
        if let Some(holder) = &mut self.holder {
            holder.touch();
        }
        self.force_close_due_to_sever();
    }

    /// Spec §4.8 `severConnection`: a sever mark left by the pool takes
    /// effect the next time this proxy is touched, rather than preempting
    /// whatever call is already in flight.
    fn force_close_due_to_sever(&mut self) {
        let Some(holder) = &self.holder else {
            return;
        };
        if !self.service.take_severed(holder.id.as_u64()) {
            return;
        }
        let holder = self.holder.take().expect("checked above");
        let service = self.service.clone();
        let critical = self.had_critical_error;
        let pooled = self.pooled;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if pooled {
                        service.restore(holder, false, critical).await;
                    } else {
                        service.release_unpooled(holder, critical).await;
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    target: "vibur::proxy::connection",
                    "severed connection could not be closed outside a tokio runtime"
                );
            }
        }
    }

    fn note_error(&mut self, error: &Error) {
        self.had_error = true;
        if self.service.is_critical(error) {
            self.had_critical_error = true;
        }
    }

    fn ensure_open(&mut self) -> Result<&mut ConnHolder<K::Connection>, Error> {
        self.holder.as_mut().ok_or(PoolError::Closed4Use.into())
    }

    pub fn is_closed(&self) -> bool {
        self.holder.is_none()
    }

    /// Spec §4.3 `prepareStatement`: take a cached statement for this
    /// `sql`/method fingerprint if one is `AVAILABLE`, otherwise prepare a
    /// fresh one.
    pub async fn prepare_statement(&mut self, sql: &str) -> Result<StatementProxy<K::Connection>, Error> {
        self.fire_invocation("prepareStatement");
        let conn_id = self.ensure_open()?.id.as_u64();
        let key = StatementKey {
            connection_id: conn_id,
            method: "prepareStatement",
            args: vec![sql.to_string()],
        };

        let outcome = self.stmt_cache.try_take(&key);
        let result = match outcome {
            TakeResult::Cached(raw) => Ok((raw, true)),
            TakeResult::Miss => {
                let holder = self.ensure_open()?;
                match holder.raw.prepare(sql).await {
                    Ok(raw) => Ok((raw, true)),
                    Err(e) => {
                        self.stmt_cache.discard(&key);
                        Err(e)
                    }
                }
            }
            TakeResult::Bypass => {
                let holder = self.ensure_open()?;
                holder.raw.prepare(sql).await.map(|raw| (raw, false))
            }
        };

        match result {
            Ok((raw, cached)) => Ok(StatementProxy::new(raw, key, cached, sql.to_string())),
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    /// Spec §4.3/§4.2: execute a statement, recording its parameters when
    /// `includeQueryParameters` is set and firing `StatementExecution` with
    /// the elapsed time and outcome once it completes.
    pub async fn execute(
        &mut self,
        stmt: &mut StatementProxy<K::Connection>,
        params: &[String],
    ) -> Result<ResultSetProxy<K::Connection>, Error> {
        self.fire_invocation("execute");
        if self.config.include_query_parameters {
            stmt.record_params(params);
        }

        let holder = self.ensure_open()?;
        let start = std::time::Instant::now();
        let raw_stmt = stmt.ensure_open()?;
        let outcome = holder.raw.execute(raw_stmt, params).await;
        let elapsed = start.elapsed();

        for hook in self.hooks.statement_execution.snapshot().iter() {
            hook.call(stmt.sql(), params, elapsed, outcome.is_ok());
        }

        if let Some(threshold) = self.config.log_query_execution_longer_than_ms {
            if elapsed.as_millis() as u64 > threshold {
                tracing::warn!(
                    target: "vibur::proxy::connection",
                    sql = stmt.sql(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "query execution exceeded logQueryExecutionLongerThanMs"
                );
            }
        }

        match outcome {
            Ok(raw_rs) => Ok(ResultSetProxy::new(raw_rs, self.hooks.clone(), self.config.log_large_result_set)),
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    /// Returns a statement to the per-connection cache, or closes it
    /// outright if it was never cacheable (spec §4.3).
    pub async fn close_statement(&mut self, mut stmt: StatementProxy<K::Connection>) -> Result<(), Error> {
        self.fire_invocation("closeStatement");
        let Some(raw) = stmt.take_raw() else {
            return Ok(());
        };
        if stmt.cached {
            self.stmt_cache.release(stmt.key.clone(), raw);
            Ok(())
        } else {
            let holder = self.ensure_open()?;
            let result = holder.raw.close_statement(raw).await;
            if let Err(e) = &result {
                self.note_error(e);
            }
            result
        }
    }

    /// Spec §4.8 `close`: runs `CloseConnection` hooks and returns the raw
    /// connection to the pool — healthy if no error was ever recorded this
    /// session, destroyed (and its generation rolled if critical) otherwise.
    pub async fn close(mut self) -> Result<(), Error> {
        self.fire_invocation("close");
        let holder = self.holder.take().ok_or(PoolError::Closed4Use)?;
        let valid = !self.had_error;
        let critical = self.had_critical_error;
        if self.pooled {
            self.service.restore(holder, valid, critical).await;
        } else {
            self.service.release_unpooled(holder, critical).await;
        }
        Ok(())
    }

    /// Spec §4.8 `abort`: always destroys the connection, regardless of
    /// whether an error was recorded.
    pub async fn abort(mut self) -> Result<(), Error> {
        self.fire_invocation("abort");
        let holder = self.holder.take().ok_or(PoolError::Closed4Use)?;
        let critical = self.had_critical_error;
        if self.pooled {
            self.service.restore(holder, false, critical).await;
        } else {
            self.service.release_unpooled(holder, critical).await;
        }
        Ok(())
    }

    /// Spec §4.8 `unwrap`/`isWrapperFor`, gated by `allowUnwrapping` (spec
    /// §6) — refused with `VI005` when disabled.
    pub fn unwrap_raw(&mut self) -> Result<&mut K::Connection, Error> {
        if !self.config.allow_unwrapping {
            return Err(PoolError::Wrapper.into());
        }
        Ok(&mut self.ensure_open()?.raw)
    }

    pub fn is_wrapper_for(&self, target: &dyn Any) -> bool {
        self.config.allow_unwrapping && target.is::<K::Connection>()
    }
}

impl<K: Connector> Drop for ConnectionProxy<K> {
    /// An application that forgets to call `close`/`abort` still gets its
    /// connection back in the pool: if a Tokio runtime is reachable from
    /// here, the restore is spawned onto it. Grounded on `sqlx-core`'s
    /// `PoolConnection` drop handler, which does the same via its internal
    /// `rt::spawn`.
    fn drop(&mut self) {
        let Some(holder) = self.holder.take() else {
            return;
        };
        let service = self.service.clone();
        let valid = !self.had_error;
        let critical = self.had_critical_error;
        let pooled = self.pooled;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if pooled {
                        service.restore(holder, valid, critical).await;
                    } else {
                        service.release_unpooled(holder, critical).await;
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    target: "vibur::proxy::connection",
                    "connection proxy dropped outside a tokio runtime; connection leaked"
                );
            }
        }
    }
}
