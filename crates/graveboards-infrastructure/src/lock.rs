// SPDX-License-Identifier: GPL-3.0-or-later

//! Cross-process mutual exclusion over the shared cache.
//!
//! A lock is a single key `lock:{name}` holding a random marker. Holding the
//! key is holding the lock; the TTL bounds how long a crashed holder can block
//! everyone else. Release only deletes the key while it still carries our
//! marker, so an expired holder can never free a successor's lock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::SharedCache;

pub fn lock_key(name: &str) -> String {
    format!("lock:{name}")
}

#[derive(Clone)]
pub struct DistributedLock {
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
    poll_interval: Duration,
}

impl DistributedLock {
    pub fn new(cache: Arc<dyn SharedCache>, ttl: Duration, poll_interval: Duration) -> Self {
        Self {
            cache,
            ttl,
            poll_interval,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try once to take the lock. `None` means someone else holds it.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> anyhow::Result<Option<LockGuard>> {
        let key = lock_key(name);
        let marker = Uuid::new_v4().to_string();

        if self.cache.set_nx(&key, &marker, ttl).await? {
            debug!(target: "lock", %key, "acquired");
            Ok(Some(LockGuard {
                cache: self.cache.clone(),
                key,
                marker,
                released: false,
            }))
        } else {
            debug!(target: "lock", %key, "held elsewhere");
            Ok(None)
        }
    }

    /// Run `work` while holding `name`, or return `None` without running it.
    ///
    /// The lock is released whether `work` succeeds, fails, or the returned
    /// future is dropped part way through.
    pub async fn with_lock<T, F, Fut>(
        &self,
        name: &str,
        ttl: Duration,
        work: F,
    ) -> anyhow::Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let Some(guard) = self.acquire(name, ttl).await? else {
            return Ok(None);
        };

        let outcome = work().await;
        guard.release().await;
        outcome.map(Some)
    }

    /// Best-effort dedup: skip `work` when another caller is already doing it.
    pub async fn try_run_exclusive<T, F, Fut>(&self, name: &str, work: F) -> anyhow::Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.with_lock(name, self.ttl, work).await
    }

    /// Wait-and-recheck: if another caller holds `name`, poll `probe` until the
    /// resource it is producing shows up, and use that instead of redoing the
    /// work. Gives up waiting after the lock TTL and runs `work` anyway.
    pub async fn run_or_wait<T, P, PFut, F, Fut>(
        &self,
        name: &str,
        probe: P,
        work: F,
    ) -> anyhow::Result<T>
    where
        P: Fn() -> PFut,
        PFut: Future<Output = anyhow::Result<Option<T>>>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(guard) = self.acquire(name, self.ttl).await? {
            return run_guarded(guard, work).await;
        }

        let deadline = Instant::now() + self.ttl;
        loop {
            tokio::time::sleep(self.poll_interval).await;

            if let Some(found) = probe().await? {
                debug!(target: "lock", name, "resource appeared while waiting");
                return Ok(found);
            }

            if let Some(guard) = self.acquire(name, self.ttl).await? {
                return run_guarded(guard, work).await;
            }

            if Instant::now() >= deadline {
                warn!(
                    target: "lock",
                    name,
                    waited_ms = self.ttl.as_millis() as u64,
                    "lock still held after ttl, proceeding without it"
                );
                return work().await;
            }
        }
    }
}

async fn run_guarded<T, F, Fut>(guard: LockGuard, work: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let outcome = work().await;
    guard.release().await;
    outcome
}

/// Proof of holding a lock. Released explicitly or on drop.
pub struct LockGuard {
    cache: Arc<dyn SharedCache>,
    key: String,
    marker: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        self.released = true;
        release(&*self.cache, &self.key, &self.marker).await;
    }
}

async fn release(cache: &dyn SharedCache, key: &str, marker: &str) {
    match cache.delete_if_equals(key, marker).await {
        Ok(true) => debug!(target: "lock", %key, "released"),
        Ok(false) => warn!(target: "lock", %key, "lock expired before release"),
        Err(err) => warn!(target: "lock", %key, error = %err, "failed to release lock"),
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(target: "lock", key = %self.key, "no runtime to release lock, leaving it to expire");
            return;
        };
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        let marker = std::mem::take(&mut self.marker);
        handle.spawn(async move {
            release(&*cache, &key, &marker).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lock(cache: Arc<InMemoryCache>) -> DistributedLock {
        DistributedLock::new(cache, Duration::from_secs(10), Duration::from_millis(250))
    }

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let cache = Arc::new(InMemoryCache::new());
        let lock = lock(cache.clone());

        let guard = lock.acquire("x", Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(guard.key(), "lock:x");
        assert!(lock.acquire("x", Duration::from_secs(10)).await.unwrap().is_none());

        guard.release().await;
        assert!(!cache.exists("lock:x").await.unwrap());
        assert!(lock.acquire("x", Duration::from_secs(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_exclusive_runs_execute_once() {
        let cache = Arc::new(InMemoryCache::new());
        let lock = lock(cache.clone());
        let runs = Arc::new(AtomicUsize::new(0));

        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let lock = lock.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                lock.try_run_exclusive("profile_fetch:1", || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let _ = gate_rx.await;
                    Ok(1)
                })
                .await
            })
        };

        while !cache.exists("lock:profile_fetch:1").await.unwrap() {
            tokio::task::yield_now().await;
        }

        let second = lock
            .try_run_exclusive("profile_fetch:1", || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(second, None);

        gate_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Some(1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!cache.exists("lock:profile_fetch:1").await.unwrap());
    }

    #[tokio::test]
    async fn lock_is_released_when_work_fails() {
        let cache = Arc::new(InMemoryCache::new());
        let lock = lock(cache.clone());

        let result: anyhow::Result<Option<()>> = lock
            .with_lock("y", Duration::from_secs(10), || async { anyhow::bail!("boom") })
            .await;
        assert!(result.is_err());
        assert!(!cache.exists("lock:y").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_released_when_work_is_cancelled() {
        let cache = Arc::new(InMemoryCache::new());
        let lock = lock(cache.clone());

        let work = lock.with_lock("z", Duration::from_secs(10), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), work).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!cache.exists("lock:z").await.unwrap());
    }

    #[tokio::test]
    async fn release_does_not_free_a_successors_lock() {
        let cache = Arc::new(InMemoryCache::new());
        let lock = lock(cache.clone());

        let guard = lock.acquire("m", Duration::from_secs(10)).await.unwrap().unwrap();
        // Simulate expiry followed by another holder.
        cache.delete("lock:m").await.unwrap();
        cache.set_nx("lock:m", "someone-else", Duration::from_secs(10)).await.unwrap();

        guard.release().await;
        assert_eq!(cache.get("lock:m").await.unwrap().as_deref(), Some("someone-else"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_returns_resource_produced_by_holder() {
        let cache = Arc::new(InMemoryCache::new());
        let lock = lock(cache.clone());
        cache.set_nx("lock:mapper:5", "holder", Duration::from_secs(10)).await.unwrap();

        let producer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(600)).await;
                cache.set_nx("mapper:5", "fetched", Duration::from_secs(60)).await.unwrap();
            })
        };

        let worked = Arc::new(AtomicUsize::new(0));
        let probe_cache = cache.clone();
        let found = lock
            .run_or_wait(
                "mapper:5",
                || {
                    let cache = probe_cache.clone();
                    async move { Ok(cache.get("mapper:5").await?) }
                },
                || async {
                    worked.fetch_add(1, Ordering::SeqCst);
                    Ok("fetched-by-waiter".to_string())
                },
            )
            .await
            .unwrap();

        producer.await.unwrap();
        assert_eq!(found, "fetched");
        assert_eq!(worked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_proceeds_once_the_holder_goes_away() {
        let cache = Arc::new(InMemoryCache::new());
        let lock = lock(cache.clone());
        cache.set_nx("lock:mapper:6", "crashed", Duration::from_secs(10)).await.unwrap();

        let started = Instant::now();
        let value = lock
            .run_or_wait(
                "mapper:6",
                || async { Ok(None::<u32>) },
                || async { Ok(42) },
            )
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!cache.exists("lock:mapper:6").await.unwrap());
    }
}
