//! The contract the proxy layer (C8) needs from a raw driver connection:
//! prepare/execute/close plus a liveness probe. Analogous to sqlx's
//! `Database` trait bundling `Connection`/`Row`/`Statement` together, except
//! narrowed to exactly what spec §4/§7's proxy layer intercepts — this
//! crate does not implement a driver itself (spec §1 treats the driver as
//! an external collaborator).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::config::IsolationLevel;
use crate::error::Error;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A raw driver connection, as seen by [`crate::proxy::ConnectionProxy`].
pub trait RawConnection: Send + 'static {
    type Statement: Send + 'static;
    type ResultSet: RawResultSet;

    /// Prepare (or otherwise obtain) a statement for `sql`.
    fn prepare<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<Self::Statement, Error>>;

    /// Execute a previously prepared statement with the given parameters.
    fn execute<'a>(
        &'a mut self,
        stmt: &'a mut Self::Statement,
        params: &'a [String],
    ) -> BoxFuture<'a, Result<Self::ResultSet, Error>>;

    /// Release a statement that is not going back into the statement cache.
    fn close_statement<'a>(&'a mut self, stmt: Self::Statement) -> BoxFuture<'a, Result<(), Error>>;

    /// Native liveness probe, used when `testConnectionQuery` is
    /// [`crate::config::IS_VALID`] (spec §4.5, §6).
    fn is_valid(&mut self, timeout: Duration) -> BoxFuture<'_, Result<bool, Error>>;

    /// Run a plain SQL statement with no result (used for `initSql` and for
    /// `testConnectionQuery` when it names an explicit query).
    fn execute_sql<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Release the underlying transport. Called by `DestroyConnection`.
    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>>;

    /// Apply `defaultAutoCommit` (spec §4.4 `InitConnection`/`readyToRestore`).
    fn set_auto_commit(&mut self, auto_commit: bool) -> BoxFuture<'_, Result<(), Error>>;

    /// Apply `defaultReadOnly`.
    fn set_read_only(&mut self, read_only: bool) -> BoxFuture<'_, Result<(), Error>>;

    /// Apply `defaultTransactionIsolation`.
    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> BoxFuture<'_, Result<(), Error>>;

    /// Apply `defaultCatalog`.
    fn set_catalog<'a>(&'a mut self, catalog: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Clear any SQL warnings accumulated since the connection was last
    /// taken (spec §4.4 `readyToRestore`, gated by `clearSQLWarnings`).
    fn clear_warnings(&mut self) -> BoxFuture<'_, Result<(), Error>>;
}

/// A raw result set, as seen by [`crate::proxy::ResultSetProxy`].
pub trait RawResultSet: Send + 'static {
    /// Advance to the next row; `Ok(false)` means exhausted.
    fn next(&mut self) -> BoxFuture<'_, Result<bool, Error>>;

    /// Release any driver-side resources held by this result set.
    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>>;
}

/// Minimal `RawConnection`/`RawResultSet` stand-ins shared by unit tests
/// across the crate that only need a connection type to exist, not to do
/// anything.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub struct NullConnection;

    impl RawConnection for NullConnection {
        type Statement = ();
        type ResultSet = NullResultSet;

        fn prepare<'a>(&'a mut self, _sql: &'a str) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn execute<'a>(
            &'a mut self,
            _stmt: &'a mut (),
            _params: &'a [String],
        ) -> BoxFuture<'a, Result<NullResultSet, Error>> {
            Box::pin(async { Ok(NullResultSet) })
        }

        fn close_statement<'a>(&'a mut self, _stmt: ()) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn is_valid(&mut self, _timeout: Duration) -> BoxFuture<'_, Result<bool, Error>> {
            Box::pin(async { Ok(true) })
        }

        fn execute_sql<'a>(&'a mut self, _sql: &'a str) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn close(&mut self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn set_auto_commit(&mut self, _auto_commit: bool) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn set_read_only(&mut self, _read_only: bool) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn set_transaction_isolation(&mut self, _level: IsolationLevel) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn set_catalog<'a>(&'a mut self, _catalog: &'a str) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn clear_warnings(&mut self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    pub struct NullResultSet;

    impl RawResultSet for NullResultSet {
        fn next(&mut self) -> BoxFuture<'_, Result<bool, Error>> {
            Box::pin(async { Ok(false) })
        }

        fn close(&mut self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }
}
