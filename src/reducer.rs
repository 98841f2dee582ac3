//! C6: background task that shrinks the pool back toward
//! `poolInitialSize` by destroying connections that have sat idle longer
//! than `connectionIdleLimitInSeconds` (spec §4.7).
//!
//! Grounded on `sqlx-core/src/pool/mod.rs`'s idle-reaper background task
//! (a `tokio::spawn`ed loop driven by `tokio::time::interval`), generalized
//! to the spec's sampling scheme: each period is split into `reducerSamples`
//! evenly spaced checks, and each check destroys at most the minimum idle
//! count observed across the samples taken so far this period, clamped so
//! the pool never shrinks below `poolInitialSize`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::PoolConfig;
use crate::connector::Connector;
use crate::factory::ConnectionFactory;
use crate::pool::Pool;

/// Handle to a running reducer task; dropping or calling [`Reducer::stop`]
/// ends the background loop.
pub struct Reducer {
    stop: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Reducer {
    pub fn spawn<K: Connector>(pool: Arc<Pool<K>>, factory: Arc<ConnectionFactory<K>>, config: Arc<PoolConfig>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();

        let handle = tokio::spawn(async move {
            run(pool, factory, config, stop2).await;
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Reducer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<K: Connector>(
    pool: Arc<Pool<K>>,
    factory: Arc<ConnectionFactory<K>>,
    config: Arc<PoolConfig>,
    stop: Arc<AtomicBool>,
) {
    let samples = config.reducer_samples.max(1);
    let period = Duration::from_secs(config.reducer_time_interval_secs.max(1));
    let sample_interval = period / samples;
    let idle_limit = Duration::from_secs(config.connection_idle_limit_secs.max(0) as u64);

    if config.connection_idle_limit_secs < 0 {
        // A negative limit disables the reducer entirely (spec §6).
        return;
    }

    let mut ticker = tokio::time::interval(sample_interval);
    let mut min_reducible_this_period: Option<usize> = None;
    let mut sample_in_period = 0u32;

    loop {
        ticker.tick().await;
        if stop.load(Ordering::Acquire) {
            return;
        }

        let headroom = pool
            .total_len()
            .saturating_sub(config.pool_initial_size) as usize;
        let reducible = pool
            .idle_len()
            .min(headroom);

        min_reducible_this_period = Some(match min_reducible_this_period {
            Some(prev) => prev.min(reducible),
            None => reducible,
        });
        sample_in_period += 1;

        if sample_in_period >= samples {
            let to_remove = min_reducible_this_period.take().unwrap_or(0);
            sample_in_period = 0;

            if to_remove > 0 {
                let drained = pool.drain_idle_longer_than(idle_limit, to_remove);
                let n = drained.len();
                for holder in drained {
                    pool.release_slot();
                    factory.destroy(holder).await;
                }
                if n > 0 {
                    debug!(target: "vibur::pool::reducer", removed = n, "reduced idle pool size");
                }
            }
        }
    }
}
