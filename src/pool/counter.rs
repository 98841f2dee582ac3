//! Spec §4.4/§5: tracks how many raw connections this pool currently owns
//! (idle + taken) against `poolMaxSize`, handing out permits to create new
//! ones and waking waiters when a slot frees up.
//!
//! Grounded on `sqlx-core/src/pool/connect.rs`'s `ConnectionCounter` and its
//! `DecrementSizeGuard`: an atomic count plus an RAII guard that puts the
//! slot back if the connection attempt that reserved it never completes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use event_listener::{Event, EventListener};

pub struct ConnectionCounter {
    size: AtomicU32,
    max_size: u32,
    available: Event,
}

impl ConnectionCounter {
    pub fn new(max_size: u32) -> Self {
        Self {
            size: AtomicU32::new(0),
            max_size,
            available: Event::new(),
        }
    }

    pub fn current(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Reserve one slot for a new connection, if the pool is below capacity.
    pub fn try_reserve(self: &Arc<Self>) -> Option<ConnectPermit> {
        let mut cur = self.size.load(Ordering::Acquire);
        loop {
            if cur >= self.max_size {
                return None;
            }
            match self.size.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ConnectPermit {
                        counter: self.clone(),
                        fulfilled: false,
                    })
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Release a slot whose connection was destroyed permanently (not
    /// returned to idle) — wakes one waiter so it can try to take its place.
    pub fn release(&self) {
        self.size.fetch_sub(1, Ordering::AcqRel);
        self.available.notify(1);
    }

    /// Wake one waiter without changing the count (an idle connection just
    /// became available instead).
    pub fn notify_returned(&self) {
        self.available.notify(1);
    }

    pub fn listen(&self) -> EventListener {
        self.available.listen()
    }
}

/// A reserved pool slot. Must be consumed by [`ConnectPermit::fulfill`] once
/// the connection is created; dropping it unfulfilled (the create attempt
/// failed) frees the slot for the next waiter.
pub struct ConnectPermit {
    counter: Arc<ConnectionCounter>,
    fulfilled: bool,
}

impl ConnectPermit {
    pub fn fulfill(mut self) {
        self.fulfilled = true;
    }
}

impl Drop for ConnectPermit {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.counter.size.fetch_sub(1, Ordering::AcqRel);
            self.counter.available.notify(1);
        }
    }
}
