//! C5: the core pool primitive — an idle queue plus a size-bounded permit
//! counter.
//!
//! Grounded on `sqlx-core/src/pool/mod.rs`'s `PoolInner`, which likewise
//! pairs an idle queue with a connection counter and blocks `acquire()` on a
//! notification primitive when the pool is both empty and at capacity.

mod counter;
mod idle;

pub use counter::{ConnectPermit, ConnectionCounter};
pub use idle::IdleQueue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::PoolConfig;
use crate::connector::Connector;
use crate::error::{Error, PoolError};
use crate::holder::ConnHolder;

/// What [`Pool::acquire`] handed back: either an existing idle connection
/// or a permit the caller must fulfill by creating a new one.
pub enum Acquired<C> {
    Idle(ConnHolder<C>),
    Permit(ConnectPermit),
}

pub struct Pool<K: Connector> {
    idle: IdleQueue<K::Connection>,
    counter: Arc<ConnectionCounter>,
    config: Arc<PoolConfig>,
    terminated: AtomicBool,
}

impl<K: Connector> Pool<K> {
    pub fn new(config: Arc<PoolConfig>) -> Self {
        Self {
            idle: IdleQueue::new(config.pool_fifo),
            counter: Arc::new(ConnectionCounter::new(config.pool_max_size)),
            config,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Drains the idle queue and marks the pool unusable for new `acquire`
    /// calls (spec §4.9 terminate). Returns the drained connections so the
    /// caller can destroy them.
    pub fn terminate(&self) -> Vec<ConnHolder<K::Connection>> {
        self.terminated.store(true, Ordering::Release);
        self.idle.drain_all()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn total_len(&self) -> u32 {
        self.counter.current()
    }

    /// Spec §4.5 `take`: returns an idle connection immediately if one is
    /// available, a permit to create one if the pool has spare capacity, or
    /// waits until either happens or `deadline` elapses.
    ///
    /// `poolFair` (spec §6) picks between two waiting strategies: the fair
    /// path parks on `event_listener::Event`, which always wakes waiters in
    /// registration order; the unfair path instead re-polls after a short
    /// random backoff without ever registering as a listener, so a caller
    /// that arrives after a slot frees can race a longer-waiting one for it
    /// instead of queuing behind them.
    pub async fn acquire(&self, deadline: Instant) -> Result<Acquired<K::Connection>, Error> {
        if self.is_terminated() {
            return Err(PoolError::Closed.into());
        }

        loop {
            if let Some(holder) = self.idle.pop() {
                return Ok(Acquired::Idle(holder));
            }
            if let Some(permit) = self.counter.try_reserve() {
                return Ok(Acquired::Permit(permit));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout(self.config.connection_timeout()).into());
            }
            let remaining = deadline - now;

            if self.config.pool_fair {
                let listener = self.counter.listen();
                if tokio::time::timeout(remaining, listener).await.is_err()
                    && Instant::now() >= deadline
                {
                    return Err(PoolError::Timeout(self.config.connection_timeout()).into());
                }
            } else {
                let jitter_ms = rand::thread_rng().gen_range(1..=5);
                tokio::time::sleep(Duration::from_millis(jitter_ms).min(remaining)).await;
            }
        }
    }

    /// Reserves a slot and places a freshly created connection directly
    /// into the idle queue, used by `DataSource::start` to populate
    /// `poolInitialSize` connections before anyone has borrowed yet (spec
    /// §4.9). Fails if the pool is already at capacity, which should not
    /// happen at startup given `poolInitialSize <= poolMaxSize` is enforced
    /// by `PoolConfig::validate`.
    pub fn seed_idle(&self, holder: ConnHolder<K::Connection>) -> Result<(), Error> {
        match self.counter.try_reserve() {
            Some(permit) => {
                permit.fulfill();
                self.idle.push(holder);
                Ok(())
            }
            None => Err(PoolError::ConnectionInit(
                "pool already at capacity while seeding initial connections".into(),
            )
            .into()),
        }
    }

    /// Returns a connection to the idle queue (spec §4.5 `restore`).
    pub fn release_idle(&self, holder: ConnHolder<K::Connection>) {
        if self.is_terminated() {
            self.counter.release();
            return;
        }
        self.idle.push(holder);
        self.counter.notify_returned();
    }

    /// Permanently removes a connection from the pool (destroyed, or
    /// dropped because its generation is stale) and frees its slot.
    pub fn release_slot(&self) {
        self.counter.release();
    }

    pub fn drain_idle_longer_than(
        &self,
        idle_limit: Duration,
        max_to_remove: usize,
    ) -> Vec<ConnHolder<K::Connection>> {
        self.idle.drain_idle_longer_than(idle_limit, max_to_remove)
    }

    /// Spec §4.6: drop idle connections from a stale generation without
    /// disturbing connections already recreated under the new one.
    pub fn drain_stale(&self, current_version: u64) -> Vec<ConnHolder<K::Connection>> {
        self.idle.drain_stale(current_version)
    }
}
