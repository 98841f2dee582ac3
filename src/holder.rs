//! Spec §3: the record a pool keeps for each raw connection it owns,
//! whether idle or currently taken.
//!
//! Grounded on `sqlx-core/src/pool/idle.rs`'s `Idle<C>` / `Live<C>` wrapper
//! structs, which pair a raw connection with pool-managed bookkeeping
//! (creation time, last-used time). This crate's `ConnHolder` folds both of
//! those plus the spec's taken-connection tracking fields into one type that
//! moves between the idle queue and "checked out" state rather than being
//! re-wrapped at each transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity for a raw connection, stable for its whole lifetime.
/// Used to key the statement cache and to report taken connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Optional diagnostics captured only when
/// [`crate::config::PoolConfig::pool_enable_connection_tracking`] is set
/// (spec §3, §4.8).
#[derive(Debug, Clone)]
pub struct TakenTracking {
    pub taken_at: Instant,
    pub last_access: Arc<Mutex<Instant>>,
    pub thread_name: String,
    pub stack_trace: Option<String>,
}

/// A point-in-time snapshot of one taken connection, as reported by
/// [`crate::operations::PoolService::taken_connections`] (spec §3,
/// §4.9 `getTakenConnections`). Shares `last_access` with the live
/// [`TakenTracking`] so a snapshot taken while the connection is still in
/// use reflects its most recent activity rather than the moment it was
/// taken.
#[derive(Debug, Clone)]
pub struct TakenConnectionInfo {
    pub connection_id: u64,
    pub taken_at: Instant,
    last_access: Arc<Mutex<Instant>>,
    pub thread_name: String,
    pub stack_trace: Option<String>,
}

impl TakenConnectionInfo {
    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }
}

impl From<(u64, &TakenTracking)> for TakenConnectionInfo {
    fn from((connection_id, tracking): (u64, &TakenTracking)) -> Self {
        Self {
            connection_id,
            taken_at: tracking.taken_at,
            last_access: tracking.last_access.clone(),
            thread_name: tracking.thread_name.clone(),
            stack_trace: tracking.stack_trace.clone(),
        }
    }
}

/// A raw connection plus the bookkeeping the pool needs around it.
pub struct ConnHolder<C> {
    pub raw: C,
    pub id: ConnectionId,
    /// The [`crate::factory::ConnectionFactory`] generation this connection
    /// was created under; compared against the factory's current version on
    /// restore to detect a generation rollover (spec §4.4, §4.6).
    pub version: u64,
    /// When this connection was last returned to the idle queue (or
    /// created, if never yet taken). Used for idle-timeout validation
    /// (spec §4.5) and the background reducer (spec §4.7).
    pub restored_at: Instant,
    pub tracking: Option<TakenTracking>,
}

impl<C> ConnHolder<C> {
    pub fn new(raw: C, version: u64) -> Self {
        Self {
            raw,
            id: ConnectionId::next(),
            version,
            restored_at: Instant::now(),
            tracking: None,
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.restored_at.elapsed()
    }

    /// Mark this connection as taken by the calling thread (spec §4.8).
    pub fn mark_taken(&mut self, capture_stack_trace: bool) {
        let now = Instant::now();
        self.tracking = Some(TakenTracking {
            taken_at: now,
            last_access: Arc::new(Mutex::new(now)),
            thread_name: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            stack_trace: if capture_stack_trace {
                Some(std::backtrace::Backtrace::force_capture().to_string())
            } else {
                None
            },
        });
    }

    /// Update `lastAccessNanoTime` (spec §4.8), called on every intercepted
    /// proxy method invocation.
    pub fn touch(&mut self) {
        if let Some(t) = &self.tracking {
            *t.last_access.lock() = Instant::now();
        }
    }

    /// Clear taken-state bookkeeping and stamp the restore time; called
    /// when the connection goes back to the idle queue.
    pub fn mark_restored(&mut self) {
        self.tracking = None;
        self.restored_at = Instant::now();
    }
}
