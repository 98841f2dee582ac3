//! C8: the `Statement` proxy — wraps a raw prepared statement, returning it
//! to the per-connection cache (C3) on close instead of destroying it.
//!
//! Grounded on `sqlx-core`'s `Statement`/`Query` wrapper types, generalized
//! to the spec's `IN_USE`/`AVAILABLE` lifecycle (spec §4.3).

use crate::error::{Error, PoolError};
use crate::raw::RawConnection;
use crate::statement_cache::StatementKey;

pub struct StatementProxy<C: RawConnection> {
    pub(super) raw: Option<C::Statement>,
    pub(super) key: StatementKey,
    pub(super) cached: bool,
    sql: String,
    recorded_params: Vec<String>,
}

impl<C: RawConnection> StatementProxy<C> {
    pub(super) fn new(raw: C::Statement, key: StatementKey, cached: bool, sql: String) -> Self {
        Self {
            raw: Some(raw),
            key,
            cached,
            sql,
            recorded_params: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The parameters of the most recent `execute` call, captured only when
    /// `includeQueryParameters` is enabled (spec §6).
    pub fn recorded_params(&self) -> &[String] {
        &self.recorded_params
    }

    pub(super) fn record_params(&mut self, params: &[String]) {
        self.recorded_params = params.to_vec();
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_none()
    }

    pub(super) fn ensure_open(&mut self) -> Result<&mut C::Statement, Error> {
        self.raw.as_mut().ok_or(PoolError::Closed4Use.into())
    }

    /// Takes ownership of the raw statement, leaving this proxy closed.
    /// Used by `ConnectionProxy::close_statement` to either release it back
    /// to the cache or hand it to the driver's own close routine.
    pub(super) fn take_raw(&mut self) -> Option<C::Statement> {
        self.raw.take()
    }
}
