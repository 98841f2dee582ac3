//! C3: bounded LRU map from statement fingerprint to a cached prepared
//! statement, pinned to one raw connection.
//!
//! Grounded on `sqlx-core`'s own dependency on `hashlink` (the crate it uses
//! for exactly this kind of ordered, evictable cache) — `hashlink::LruCache`
//! gives us eviction-on-insert for free, matching spec §4.3's "insert a new
//! entry ... respecting the cap by LRU eviction of `AVAILABLE` entries".

use hashlink::LruCache;
use parking_lot::Mutex;

/// Hard cap on cached statements, per spec §4.3/§6.
pub const HARD_CAP: usize = 2000;

/// Fingerprint for a cached prepared statement: the owning connection's
/// identity, the preparing method name, and its argument tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub connection_id: u64,
    pub method: &'static str,
    pub args: Vec<String>,
}

/// Outcome of [`StatementCache::take_or_create`].
pub enum Taken<S> {
    /// An existing `AVAILABLE` entry was removed from the cache and handed
    /// back `IN_USE`; [`StatementCache::release`] returns it.
    Cached(S),
    /// The key was already `IN_USE`, or caching is disabled; a fresh,
    /// uncached statement is returned and must be closed directly.
    Bypassed(S),
    /// No entry existed; a fresh statement was created and is now tracked
    /// `IN_USE` under `key`.
    Created(S),
}

impl<S> Taken<S> {
    pub fn into_inner(self) -> S {
        match self {
            Taken::Cached(s) | Taken::Bypassed(s) | Taken::Created(s) => s,
        }
    }

    /// Whether `Statement::close` should return this to the cache rather
    /// than closing the raw statement outright.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Taken::Cached(_) | Taken::Created(_))
    }
}

/// Result of [`StatementCache::try_take`].
pub enum TakeResult<S> {
    /// A cached `AVAILABLE` statement was found and is now `IN_USE`.
    Cached(S),
    /// No entry existed; the caller should create one and call
    /// [`StatementCache::release`] when done — the key is already marked
    /// `IN_USE` so a concurrent identical key bypasses the cache instead of
    /// racing this creation.
    Miss,
    /// Caching is disabled, or the key is already `IN_USE` elsewhere; the
    /// caller should create an uncached, one-off statement.
    Bypass,
}

/// Per-connection bounded LRU cache of prepared statements.
///
/// An entry only ever exists in the map while `AVAILABLE`; taking a
/// statement removes it, and `release` reinserts it. This keeps ownership
/// unambiguous: the cache never holds a reference to a statement someone
/// else is using.
pub struct StatementCache<S> {
    cache: Mutex<LruCache<StatementKey, S>>,
    in_use: Mutex<std::collections::HashSet<StatementKey>>,
    max_size: usize,
}

impl<S> StatementCache<S> {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.min(HARD_CAP);
        Self {
            cache: Mutex::new(LruCache::new(max_size.max(1))),
            in_use: Mutex::new(std::collections::HashSet::new()),
            max_size,
        }
    }

    /// `size == 0` disables caching entirely (spec §8 boundary behavior).
    pub fn is_disabled(&self) -> bool {
        self.max_size == 0
    }

    /// Spec §4.3 `takeOrCreate`: return the `AVAILABLE` entry for `key` if
    /// one exists, otherwise call `produce` for a fresh statement. A key
    /// already `IN_USE` (concurrent use of an identical statement, e.g. from
    /// two threads sharing a raw connection) bypasses the cache rather than
    /// racing with the in-flight user.
    pub fn take_or_create<F, E>(&self, key: StatementKey, produce: F) -> Result<Taken<S>, E>
    where
        F: FnOnce() -> Result<S, E>,
    {
        if self.is_disabled() {
            return produce().map(Taken::Bypassed);
        }

        {
            let mut in_use = self.in_use.lock();
            if in_use.contains(&key) {
                drop(in_use);
                return produce().map(Taken::Bypassed);
            }
            let mut cache = self.cache.lock();
            if let Some(stmt) = cache.remove(&key) {
                in_use.insert(key);
                return Ok(Taken::Cached(stmt));
            }
            in_use.insert(key.clone());
        }

        match produce() {
            Ok(stmt) => Ok(Taken::Created(stmt)),
            Err(e) => {
                self.in_use.lock().remove(&key);
                Err(e)
            }
        }
    }

    /// Non-blocking half of `takeOrCreate` for callers whose fallback
    /// statement creation is itself async (the proxy layer's `prepare` is):
    /// resolves the cache/in-use state synchronously and leaves it to the
    /// caller to `await` a fresh statement on [`TakeResult::Miss`] /
    /// [`TakeResult::Bypass`].
    pub fn try_take(&self, key: &StatementKey) -> TakeResult<S> {
        if self.is_disabled() {
            return TakeResult::Bypass;
        }
        let mut in_use = self.in_use.lock();
        if in_use.contains(key) {
            return TakeResult::Bypass;
        }
        let mut cache = self.cache.lock();
        if let Some(stmt) = cache.remove(key) {
            in_use.insert(key.clone());
            return TakeResult::Cached(stmt);
        }
        in_use.insert(key.clone());
        TakeResult::Miss
    }

    /// Flip an `IN_USE` statement back to `AVAILABLE`, inserting it into the
    /// LRU map (which may evict the least-recently-used `AVAILABLE` entry to
    /// respect the cap). No-op if caching is disabled.
    pub fn release(&self, key: StatementKey, statement: S) {
        if self.is_disabled() {
            return;
        }
        self.in_use.lock().remove(&key);
        self.cache.lock().insert(key, statement);
    }

    /// Drop the `IN_USE` marker without returning the statement to the
    /// cache (used when the statement failed and should not be reused).
    pub fn discard(&self, key: &StatementKey) {
        self.in_use.lock().remove(key);
    }

    /// Evict and drop all entries belonging to `connection_id` (called on
    /// connection destroy, spec §4.3 `removeAll`).
    pub fn remove_all(&self, connection_id: u64) {
        let mut cache = self.cache.lock();
        let keys: Vec<StatementKey> = cache
            .iter()
            .filter(|(k, _)| k.connection_id == connection_id)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            cache.remove(&k);
        }
        self.in_use
            .lock()
            .retain(|k| k.connection_id != connection_id);
    }

    /// Drop every cached entry (spec §4.3 `closeAll`, called on terminate).
    pub fn close_all(&self) {
        self.cache.lock().clear();
        self.in_use.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> StatementKey {
        StatementKey {
            connection_id: 1,
            method: "prepareStatement",
            args: vec![format!("select {n}")],
        }
    }

    #[test]
    fn reuses_released_statement() {
        let cache: StatementCache<u32> = StatementCache::new(10);
        let k = key(1);
        let taken = cache.take_or_create(k.clone(), || Ok::<_, ()>(42)).unwrap();
        assert!(matches!(taken, Taken::Created(42)));
        cache.release(k.clone(), taken.into_inner());
        assert_eq!(cache.len(), 1);

        let taken = cache.take_or_create(k.clone(), || Ok::<_, ()>(0)).unwrap();
        assert!(matches!(taken, Taken::Cached(42)));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn concurrent_identical_key_bypasses_cache() {
        let cache: StatementCache<u32> = StatementCache::new(10);
        let k = key(1);
        let first = cache.take_or_create(k.clone(), || Ok::<_, ()>(1)).unwrap();
        assert!(matches!(first, Taken::Created(1)));

        let second = cache.take_or_create(k.clone(), || Ok::<_, ()>(2)).unwrap();
        assert!(matches!(second, Taken::Bypassed(2)));
        assert!(!second.is_cacheable());
    }

    #[test]
    fn zero_size_disables_caching() {
        let cache: StatementCache<u32> = StatementCache::new(0);
        assert!(cache.is_disabled());
        let taken = cache.take_or_create(key(1), || Ok::<_, ()>(7)).unwrap();
        assert!(matches!(taken, Taken::Bypassed(7)));
        cache.release(key(1), 7);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn remove_all_clears_only_that_connection() {
        let cache: StatementCache<u32> = StatementCache::new(10);
        let k1 = StatementKey {
            connection_id: 1,
            method: "m",
            args: vec![],
        };
        let k2 = StatementKey {
            connection_id: 2,
            method: "m",
            args: vec![],
        };
        cache.release(k1, 1);
        cache.release(k2, 2);
        cache.remove_all(1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_respects_cap() {
        let cache: StatementCache<u32> = StatementCache::new(2);
        for n in 0..3 {
            cache.release(key(n), n as u32);
        }
        assert_eq!(cache.len(), 2);
    }
}
