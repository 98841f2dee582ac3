//! C8: the `ResultSet` proxy — tracks how many rows were consumed and
//! fires the `ResultSetRetrieval` hook on close (spec §4.2, §6
//! `logLargeResultSet`).
//!
//! Grounded on `sqlx-core`'s cursor-style `Stream<Item = Result<Row>>`
//! result sets, reduced here to a `next()`/`close()` pair that matches the
//! JDBC-shaped `ResultSet` the spec describes.

use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, PoolError};
use crate::hooks::HookRegistry;
use crate::raw::{RawConnection, RawResultSet};

pub struct ResultSetProxy<C: RawConnection> {
    raw: Option<C::ResultSet>,
    hooks: Arc<HookRegistry<C>>,
    first_row_at: Option<Instant>,
    row_count: u64,
    log_large_result_set: Option<u64>,
}

impl<C: RawConnection> ResultSetProxy<C> {
    pub(super) fn new(raw: C::ResultSet, hooks: Arc<HookRegistry<C>>, log_large_result_set: Option<u64>) -> Self {
        Self {
            raw: Some(raw),
            hooks,
            first_row_at: None,
            row_count: 0,
            log_large_result_set,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_none()
    }

    /// Advances to the next row; `Ok(false)` means exhausted. Mirrors
    /// `java.sql.ResultSet::next`.
    pub async fn next(&mut self) -> Result<bool, Error> {
        let raw = self.raw.as_mut().ok_or(PoolError::Closed4Use)?;
        if self.first_row_at.is_none() {
            self.first_row_at = Some(Instant::now());
        }
        let has_row = raw.next().await?;
        if has_row {
            self.row_count += 1;
        }
        Ok(has_row)
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Closes the raw result set and fires the `ResultSetRetrieval` hook
    /// with the total row count and the time since the first row was
    /// fetched. A result set that warns past `logLargeResultSet` is still
    /// closed normally — the threshold only affects what the application's
    /// registered hook chooses to log.
    pub async fn close(&mut self) -> Result<(), Error> {
        let Some(mut raw) = self.raw.take() else {
            return Ok(());
        };
        let elapsed = self.first_row_at.map(|t| t.elapsed()).unwrap_or_default();
        let result = raw.close().await;

        for hook in self.hooks.result_set_retrieval.snapshot().iter() {
            hook.call(self.row_count, elapsed);
        }

        if let Some(threshold) = self.log_large_result_set {
            if self.row_count > threshold {
                tracing::warn!(
                    target: "vibur::proxy::result_set",
                    rows = self.row_count,
                    threshold,
                    "result set exceeded logLargeResultSet"
                );
            }
        }

        result
    }
}

impl<C: RawConnection> Drop for ResultSetProxy<C> {
    fn drop(&mut self) {
        if self.raw.is_some() {
            tracing::debug!(
                target: "vibur::proxy::result_set",
                "result set dropped without an explicit close"
            );
        }
    }
}
