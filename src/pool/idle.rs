//! Spec §4.5: the set of connections a pool currently considers idle, plus
//! the take-order primitive used by [`super::Pool`].
//!
//! Grounded on `sqlx-core/src/pool/idle.rs`'s idle-connection queue, but
//! expressed as a single `Mutex<VecDeque<...>>` rather than a lock-free
//! `ArrayQueue`: `poolFifo` needs to pop from either end of the same
//! structure, which a deque gives directly without a second data structure.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::holder::ConnHolder;

pub struct IdleQueue<C> {
    queue: Mutex<VecDeque<ConnHolder<C>>>,
    fifo: bool,
}

impl<C> IdleQueue<C> {
    pub fn new(fifo: bool) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fifo,
        }
    }

    pub fn push(&self, holder: ConnHolder<C>) {
        self.queue.lock().push_back(holder);
    }

    /// Removes and returns the next connection per `poolFifo` ordering:
    /// `true` takes the oldest-idle connection first (promotes even use of
    /// the whole pool); `false` (the default) takes the most-recently-idle
    /// one, keeping fewer connections warm under light load.
    pub fn pop(&self) -> Option<ConnHolder<C>> {
        let mut q = self.queue.lock();
        if self.fifo {
            q.pop_front()
        } else {
            q.pop_back()
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every connection idle longer than `idle_limit`,
    /// stopping after `max_to_remove` (spec §4.7, used by the background
    /// reducer).
    pub fn drain_idle_longer_than(
        &self,
        idle_limit: Duration,
        max_to_remove: usize,
    ) -> Vec<ConnHolder<C>> {
        let mut q = self.queue.lock();
        let mut removed = Vec::new();
        let mut i = 0;
        while i < q.len() && removed.len() < max_to_remove {
            if q[i].idle_for() >= idle_limit {
                removed.push(q.remove(i).expect("index in bounds"));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Drains every idle connection (spec §4.9 terminate).
    pub fn drain_all(&self) -> Vec<ConnHolder<C>> {
        std::mem::take(&mut *self.queue.lock()).into_iter().collect()
    }

    /// Removes every idle connection whose generation differs from
    /// `current_version` (spec §4.6 generation rollover), leaving
    /// current-generation connections untouched.
    pub fn drain_stale(&self, current_version: u64) -> Vec<ConnHolder<C>> {
        let mut q = self.queue.lock();
        let (stale, fresh): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut *q)
            .into_iter()
            .partition(|h| h.version != current_version);
        *q = fresh;
        stale.into_iter().collect()
    }
}
