//! Error and Result types.

use std::error::Error as StdError;
use std::fmt::{self, Debug, Display};
use std::time::Duration;

/// A specialized `Result` type for Vibur.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A generic error that represents all the ways a pool operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error was returned by the database (or a hook acting on it).
    #[error("database error: {0}")]
    Database(Box<dyn DatabaseError>),

    /// A pool-lifecycle error with one of the Vibur SQLSTATEs (`VI000`..`VI005`).
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// I/O error while establishing or using a raw connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Walks `self` (and, if it wraps a [`DatabaseError`], its `next()` chain)
    /// looking for a SQLSTATE in `critical`. Mirrors the JDBC idiom of
    /// recursively inspecting `SQLException::getNextException()`.
    pub fn any_sql_state_in<'a>(&self, critical: impl IntoIterator<Item = &'a str>) -> bool {
        let critical: Vec<&str> = critical.into_iter().collect();
        match self {
            Error::Database(db) => {
                let mut cur: Option<&dyn DatabaseError> = Some(db.as_ref());
                while let Some(e) = cur {
                    if let Some(state) = e.sql_state() {
                        if critical.iter().any(|c| *c == state) {
                            return true;
                        }
                    }
                    cur = e.next();
                }
                false
            }
            _ => false,
        }
    }
}

/// Abstract access to information returned from the database about an error,
/// including its SQLSTATE and any chained follow-on exceptions.
pub trait DatabaseError: 'static + StdError + Send + Sync {
    /// The primary, human-readable error message.
    fn message(&self) -> &str;

    /// The five-character SQLSTATE code, if the driver supplied one.
    fn sql_state(&self) -> Option<&str>;

    /// The next exception in a driver-reported chain (JDBC's `getNextException`).
    fn next(&self) -> Option<&dyn DatabaseError> {
        None
    }

    /// Whether a connect attempt that failed with this error is worth retrying.
    fn is_retryable_connect_error(&self) -> bool {
        false
    }
}

impl Display for dyn DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Pool-lifecycle errors, each carrying the Vibur SQLSTATE from spec §6.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `VI000` — the pool has not been started.
    #[error("VI000: pool not started")]
    NotStarted,

    /// `VI001` — the pool is terminated and cannot serve new connections.
    #[error("VI001: pool is closed")]
    Closed,

    /// `VI002` — no connection became available before the deadline.
    #[error("VI002: timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    /// `VI003` — connection creation failed after all configured retries.
    #[error("VI003: connection creation failed: {0}")]
    ConnectionInit(String),

    /// `VI004` — a call was made on a proxy after it was closed.
    #[error("VI004: object is closed")]
    Closed4Use,

    /// `VI005` — `unwrap`/`isWrapperFor` was attempted but unwrapping is disabled.
    #[error("VI005: wrapper error")]
    Wrapper,
}

impl PoolError {
    /// The SQLSTATE code for this variant.
    pub fn sql_state(&self) -> &'static str {
        match self {
            PoolError::NotStarted => "VI000",
            PoolError::Closed => "VI001",
            PoolError::Timeout(_) => "VI002",
            PoolError::ConnectionInit(_) => "VI003",
            PoolError::Closed4Use => "VI004",
            PoolError::Wrapper => "VI005",
        }
    }
}
