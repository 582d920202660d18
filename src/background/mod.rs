//! Background tasks — periodic cache sweeping.
//!
//! [`RequestCache`] already sweeps before every lookup, which bounds growth
//! while the cache is in use. The sweeper covers the idle case: entries
//! left behind after the last lookup are dropped on a fixed interval
//! instead of living until the next call.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::RequestCache;

/// Handle to a running sweeper task.
///
/// Dropping the handle does not stop the task; call [`stop`](Self::stop),
/// cancel the token, or drop every handle to the cache.
#[derive(Debug)]
pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the task to exit and waits for it.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }

    /// Returns `true` once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Spawns a task that calls [`RequestCache::sweep`] every
/// `cache.config().sweep_interval`.
///
/// The task holds only a weak reference and exits on its own once the cache
/// is dropped. Must be called from within a Tokio runtime.
pub fn spawn_sweeper<T, E>(cache: &RequestCache<T, E>, token: CancellationToken) -> SweeperHandle
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let weak = cache.downgrade();
    let period = cache.config().sweep_interval;
    let child = token.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = child.cancelled() => {
                    debug!("cache sweeper cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(cache) = weak.upgrade() else {
                        debug!("cache dropped, sweeper exiting");
                        break;
                    };
                    let removed = cache.sweep();
                    trace!(removed, "periodic cache sweep");
                }
            }
        }
    });

    SweeperHandle { token, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use std::time::Duration;

    fn config() -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(30),
            linger: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_are_swept() {
        let cache: RequestCache<u32, String> = RequestCache::new(config());
        let sweeper = spawn_sweeper(&cache, CancellationToken::new());

        cache.get_or_fetch("k".into(), || async { Ok(1) }).await.unwrap();
        assert_eq!(cache.len(), 1);

        // Past the linger and one sweep period.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());

        sweeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_cancelled() {
        let cache: RequestCache<u32, String> = RequestCache::new(config());
        let token = CancellationToken::new();
        let sweeper = spawn_sweeper(&cache, token.clone());

        token.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn exits_after_cache_dropped() {
        let cache: RequestCache<u32, String> = RequestCache::new(config());
        let sweeper = spawn_sweeper(&cache, CancellationToken::new());
        drop(cache);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(sweeper.is_finished());
    }
}
