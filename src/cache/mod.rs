//! Request coalescing cache — one in-flight fetch per key, shared by every caller.
//!
//! [`RequestCache`] collapses duplicate concurrent fetches for the same
//! [`CacheKey`] into a single future. Every caller that arrives while the
//! fetch is pending, or shortly after it settles, receives a clone of the
//! same outcome.
//!
//! ## Entry lifecycle
//!
//! 1. **Created** when `get_or_fetch` misses; the fetch future is wrapped in
//!    [`futures::future::Shared`] and stamped with its insertion time.
//! 2. **Shared** by later callers for the same key while it is live.
//! 3. **Settled** when the fetch completes, success or failure. The entry
//!    stays shared for `linger` so back-to-back repeats skip the network.
//! 4. **Evicted** once `linger` has passed since settling, or `ttl` has
//!    passed since insertion, whichever comes first. Eviction happens in
//!    [`RequestCache::sweep`], which runs before every lookup and
//!    periodically from [`crate::background::spawn_sweeper`].
//!
//! Errors must be `Clone` because a failed fetch is delivered to every waiter.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tracing::debug;

/// Maximum age of any entry, pending or settled.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// How long a settled entry keeps answering repeat calls.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(2);

/// Period of the background sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Tuning for a [`RequestCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub linger: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            linger: DEFAULT_LINGER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Deterministic identifier for one request shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

type SharedFetch<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct CacheEntry<T, E>
where
    T: Clone,
    E: Clone,
{
    future: SharedFetch<T, E>,
    inserted_at: Instant,
    // Written once by the wrapped future when the fetch settles.
    settled_at: Arc<OnceLock<Instant>>,
}

impl<T: Clone, E: Clone> CacheEntry<T, E> {
    fn is_expired(&self, now: Instant, config: &CacheConfig) -> bool {
        if now.duration_since(self.inserted_at) >= config.ttl {
            return true;
        }
        self.settled_at
            .get()
            .is_some_and(|settled| now.duration_since(*settled) >= config.linger)
    }
}

/// Keyed store of shared in-flight fetches.
///
/// Cheap to clone; clones share the same map. Constructed explicitly so each
/// consumer (and each test) owns an isolated instance.
///
/// # Examples
///
/// ```
/// use testhist::cache::{CacheConfig, RequestCache};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache: RequestCache<u32, String> = RequestCache::new(CacheConfig::default());
///
/// let first = cache.get_or_fetch("answer".into(), || async { Ok(42) }).await;
/// // Settled but still lingering: the second closure never runs.
/// let second = cache.get_or_fetch("answer".into(), || async { Ok(0) }).await;
///
/// assert_eq!(first, Ok(42));
/// assert_eq!(second, Ok(42));
/// # }
/// ```
pub struct RequestCache<T, E>
where
    T: Clone,
    E: Clone,
{
    inner: Arc<Mutex<HashMap<CacheKey, CacheEntry<T, E>>>>,
    config: CacheConfig,
}

impl<T: Clone, E: Clone> Clone for RequestCache<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config,
        }
    }
}

impl<T, E> RequestCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the shared outcome for `key`, starting `fetch` only when no
    /// live entry exists.
    ///
    /// Expired entries are swept first. `fetch` runs with the map unlocked,
    /// so it may touch this cache. When two callers miss the same key at once
    /// both closures run, but only the first inserted future is ever polled;
    /// the other is dropped unstarted.
    pub async fn get_or_fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(future) = self.live_entry(&key) {
            return future.await;
        }

        debug!(key = %key, "request cache miss, starting fetch");
        let fetch = fetch();

        let future = {
            let now = Instant::now();
            let mut map = self.lock();
            Self::sweep_locked(&mut map, now, &self.config);

            match map.get(&key) {
                Some(entry) => {
                    debug!(key = %key, "request cache filled concurrently, joining it");
                    entry.future.clone()
                }
                None => {
                    let settled_at = Arc::new(OnceLock::new());
                    let marker = Arc::clone(&settled_at);
                    let future = async move {
                        let outcome = fetch.await;
                        let _ = marker.set(Instant::now());
                        outcome
                    }
                    .boxed()
                    .shared();
                    map.insert(
                        key,
                        CacheEntry {
                            future: future.clone(),
                            inserted_at: now,
                            settled_at,
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    /// Sweeps, then returns a handle on `key`'s entry if one is still live.
    fn live_entry(&self, key: &CacheKey) -> Option<SharedFetch<T, E>> {
        let now = Instant::now();
        let mut map = self.lock();
        Self::sweep_locked(&mut map, now, &self.config);
        map.get(key).map(|entry| {
            debug!(key = %key, settled = entry.settled_at.get().is_some(), "request cache hit");
            entry.future.clone()
        })
    }

    /// Drops every entry past its linger or TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut map = self.lock();
        Self::sweep_locked(&mut map, now, &self.config)
    }

    /// Removes the entry for `key`. Callers already awaiting it are unaffected.
    pub fn clear(&self, key: &CacheKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Removes every entry.
    pub fn clear_all(&self) {
        let mut map = self.lock();
        if !map.is_empty() {
            debug!(entries = map.len(), "request cache cleared");
        }
        map.clear();
    }

    /// Returns `true` if `key` has a live entry.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.lock()
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now, &self.config))
    }

    /// Number of stored entries, including ones awaiting the next sweep.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// A handle that does not keep the map alive. Used by the sweeper task.
    pub(crate) fn downgrade(&self) -> WeakRequestCache<T, E> {
        WeakRequestCache {
            inner: Arc::downgrade(&self.inner),
            config: self.config,
        }
    }

    fn sweep_locked(
        map: &mut HashMap<CacheKey, CacheEntry<T, E>>,
        now: Instant,
        config: &CacheConfig,
    ) -> usize {
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired(now, config));
        let removed = before - map.len();
        if removed > 0 {
            debug!(removed, remaining = map.len(), "request cache swept");
        }
        removed
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry<T, E>>> {
        // Every critical section is a single map operation, so a poisoned
        // map is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct WeakRequestCache<T, E>
where
    T: Clone,
    E: Clone,
{
    inner: std::sync::Weak<Mutex<HashMap<CacheKey, CacheEntry<T, E>>>>,
    config: CacheConfig,
}

impl<T, E> WeakRequestCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Returns `None` once every strong handle has been dropped.
    pub(crate) fn upgrade(&self) -> Option<RequestCache<T, E>> {
        self.inner.upgrade().map(|inner| RequestCache {
            inner,
            config: self.config,
        })
    }
}
