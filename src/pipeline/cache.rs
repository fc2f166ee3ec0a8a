//! Pipeline cache: bounded, LRU, singleflight.
//!
//! ## Why singleflight?
//!
//! Constructing a pipeline loads models and can take tens of seconds. When a
//! burst of requests with identical options arrives on a cold cache, only
//! the first caller (the *leader*) builds; everybody else awaits the same
//! `watch` channel and receives the very same `Arc`.
//!
//! ## Eviction
//!
//! Entries are leased, not borrowed: each [`PipelineLease`] bumps a user
//! counter that drops back when the lease is dropped. Eviction only ever
//! considers entries with zero users, picking the least recently acquired.
//! If every cached entry is busy and a new pipeline is built, the new handle
//! is returned uncached rather than exceeding capacity.
//!
//! All bookkeeping happens under one short, synchronous mutex that is never
//! held across an `.await`; using an acquired pipeline needs no lock at all.

use crate::error::ServeError;
use crate::options::OptionsKey;
use crate::pipeline::ConversionPipeline;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type BuildOutcome<P> = Option<Result<Arc<P>, String>>;

enum Slot<P: ?Sized> {
    Ready(ReadyEntry<P>),
    Building(watch::Receiver<BuildOutcome<P>>),
}

struct ReadyEntry<P: ?Sized> {
    handle: Arc<P>,
    users: Arc<AtomicUsize>,
    last_used: u64,
}

struct CacheState<P: ?Sized> {
    slots: HashMap<OptionsKey, Slot<P>>,
    tick: u64,
    stats: CacheStats,
}

impl<P: ?Sized> CacheState<P> {
    fn ready_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }

    /// Evict the least recently used idle entry. Returns `false` when every
    /// cached entry is in use.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .slots
            .iter()
            .filter_map(|(k, s)| match s {
                Slot::Ready(e) if e.users.load(Ordering::Acquire) == 0 => Some((k, e.last_used)),
                _ => None,
            })
            .min_by_key(|(_, used)| *used)
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                self.slots.remove(&key);
                self.stats.evictions += 1;
                info!("Evicted pipeline {}", key.short());
                true
            }
            None => false,
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub capacity: usize,
    pub cached: usize,
    pub in_use: usize,
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub evictions: u64,
    pub failures: u64,
    /// Built while the cache was full of busy entries and handed out uncached.
    pub uncached: u64,
}

/// Bounded cache from options key to constructed pipeline.
pub struct PipelineCache<P: ?Sized + Send + Sync = dyn ConversionPipeline> {
    capacity: usize,
    state: Mutex<CacheState<P>>,
}

/// A pipeline on loan from the cache. Keeps its entry from being evicted
/// until dropped.
pub struct PipelineLease<P: ?Sized> {
    handle: Arc<P>,
    users: Option<Arc<AtomicUsize>>,
}

impl<P: ?Sized> PipelineLease<P> {
    /// The shared handle. Clone it to move the pipeline into a blocking task.
    pub fn handle(&self) -> &Arc<P> {
        &self.handle
    }

    /// `false` when the pipeline could not be cached (all entries busy).
    pub fn is_cached(&self) -> bool {
        self.users.is_some()
    }
}

impl<P: ?Sized> Deref for PipelineLease<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.handle
    }
}

impl<P: ?Sized> Drop for PipelineLease<P> {
    fn drop(&mut self) {
        if let Some(users) = &self.users {
            users.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

enum Step<P: ?Sized> {
    Wait(watch::Receiver<BuildOutcome<P>>),
    Lead(watch::Sender<BuildOutcome<P>>),
}

impl<P: ?Sized + Send + Sync> PipelineCache<P> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                tick: 0,
                stats: CacheStats {
                    capacity,
                    ..CacheStats::default()
                },
            }),
        }
    }

    /// Return the pipeline for `key`, building it with `build` if needed.
    ///
    /// Concurrent callers for the same uncached key share one build. A build
    /// failure is reported to every waiter as [`ServeError::PipelineBuild`]
    /// and nothing is cached, so the next call retries.
    pub async fn acquire<F, Fut>(
        &self,
        key: &OptionsKey,
        build: F,
    ) -> Result<PipelineLease<P>, ServeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<P>, ServeError>>,
    {
        let mut build = Some(build);
        loop {
            let step = {
                let mut state = self.state.lock();
                state.tick += 1;
                let tick = state.tick;
                match state.slots.get_mut(key) {
                    Some(Slot::Ready(entry)) => {
                        entry.last_used = tick;
                        entry.users.fetch_add(1, Ordering::AcqRel);
                        let lease = PipelineLease {
                            handle: entry.handle.clone(),
                            users: Some(entry.users.clone()),
                        };
                        state.stats.hits += 1;
                        return Ok(lease);
                    }
                    Some(Slot::Building(rx)) => Step::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        state.slots.insert(key.clone(), Slot::Building(rx));
                        state.stats.misses += 1;
                        Step::Lead(tx)
                    }
                }
            };

            match step {
                Step::Wait(mut rx) => {
                    debug!("Waiting for in-flight build of {}", key.short());
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(outcome) => outcome.clone(),
                        // Leader was cancelled; race to become the new one.
                        Err(_) => continue,
                    };
                    return match outcome {
                        Some(Ok(handle)) => Ok(self.lease_for(key, handle)),
                        Some(Err(detail)) => Err(ServeError::PipelineBuild {
                            key: key.to_string(),
                            detail,
                        }),
                        None => continue,
                    };
                }
                Step::Lead(tx) => {
                    let Some(build) = build.take() else {
                        // A caller leads at most once.
                        return Err(ServeError::Internal("pipeline builder consumed".into()));
                    };
                    return self.lead_build(key, tx, build).await;
                }
            }
        }
    }

    async fn lead_build<F, Fut>(
        &self,
        key: &OptionsKey,
        tx: watch::Sender<BuildOutcome<P>>,
        build: F,
    ) -> Result<PipelineLease<P>, ServeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<P>, ServeError>>,
    {
        let mut guard = BuildGuard {
            cache: self,
            key,
            tx,
            armed: true,
        };
        info!("Building pipeline {}", key.short());
        let result = build().await;
        guard.armed = false;

        let mut state = self.state.lock();
        state.stats.builds += 1;
        match result {
            Ok(handle) => {
                state.slots.remove(key);
                while state.ready_count() >= self.capacity {
                    if !state.evict_one() {
                        break;
                    }
                }
                let lease = if state.ready_count() < self.capacity {
                    let users = Arc::new(AtomicUsize::new(1));
                    let tick = state.tick;
                    state.slots.insert(
                        key.clone(),
                        Slot::Ready(ReadyEntry {
                            handle: handle.clone(),
                            users: users.clone(),
                            last_used: tick,
                        }),
                    );
                    PipelineLease {
                        handle: handle.clone(),
                        users: Some(users),
                    }
                } else {
                    warn!(
                        "All {} cached pipelines are in use; {} served uncached",
                        self.capacity,
                        key.short()
                    );
                    state.stats.uncached += 1;
                    PipelineLease {
                        handle: handle.clone(),
                        users: None,
                    }
                };
                drop(state);
                let _ = guard.tx.send(Some(Ok(handle)));
                Ok(lease)
            }
            Err(e) => {
                state.slots.remove(key);
                state.stats.failures += 1;
                drop(state);
                let detail = match &e {
                    ServeError::PipelineBuild { detail, .. } => detail.clone(),
                    other => other.to_string(),
                };
                warn!("Pipeline build {} failed: {}", key.short(), detail);
                let _ = guard.tx.send(Some(Err(detail.clone())));
                Err(ServeError::PipelineBuild {
                    key: key.to_string(),
                    detail,
                })
            }
        }
    }

    /// Lease `handle` for a waiter, counted if it is (still) the cached one.
    fn lease_for(&self, key: &OptionsKey, handle: Arc<P>) -> PipelineLease<P> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        if let Some(Slot::Ready(entry)) = state.slots.get_mut(key) {
            if Arc::ptr_eq(&entry.handle, &handle) {
                entry.last_used = tick;
                entry.users.fetch_add(1, Ordering::AcqRel);
                let users = entry.users.clone();
                state.stats.hits += 1;
                return PipelineLease {
                    handle,
                    users: Some(users),
                };
            }
        }
        PipelineLease {
            handle,
            users: None,
        }
    }

    /// Drop every idle cached pipeline. Busy ones stay. Returns the count.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.slots.len();
        state.slots.retain(|_, slot| match slot {
            Slot::Ready(e) => e.users.load(Ordering::Acquire) > 0,
            Slot::Building(_) => true,
        });
        let removed = before - state.slots.len();
        state.stats.evictions += removed as u64;
        removed
    }

    pub fn contains(&self, key: &OptionsKey) -> bool {
        matches!(self.state.lock().slots.get(key), Some(Slot::Ready(_)))
    }

    pub fn len(&self) -> usize {
        self.state.lock().ready_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut stats = state.stats;
        stats.cached = 0;
        stats.in_use = 0;
        for slot in state.slots.values() {
            if let Slot::Ready(e) = slot {
                stats.cached += 1;
                if e.users.load(Ordering::Acquire) > 0 {
                    stats.in_use += 1;
                }
            }
        }
        stats
    }
}

/// Removes the `Building` slot if the leader's future is dropped mid-build,
/// so waiters can elect a new leader instead of hanging.
struct BuildGuard<'a, P: ?Sized + Send + Sync> {
    cache: &'a PipelineCache<P>,
    key: &'a OptionsKey,
    /// Dropped after the slot is cleared, which wakes the waiters.
    tx: watch::Sender<BuildOutcome<P>>,
    armed: bool,
}

impl<P: ?Sized + Send + Sync> Drop for BuildGuard<'_, P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.cache.state.lock();
        if matches!(state.slots.get(self.key), Some(Slot::Building(_))) {
            state.slots.remove(self.key);
            debug!("Build of {} cancelled", self.key.short());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{canonicalize, ConversionOptions};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Handle(u32);

    fn key(n: u32) -> OptionsKey {
        canonicalize(
            &ConversionOptions::builder()
                .images_scale(1.0 + n as f64)
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    async fn get(
        cache: &PipelineCache<Handle>,
        k: &OptionsKey,
        builds: &AtomicU32,
    ) -> PipelineLease<Handle> {
        cache
            .acquire(k, || async {
                let n = builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Handle(n)))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn hit_returns_same_handle() {
        let cache = PipelineCache::<Handle>::new(2);
        let builds = AtomicU32::new(0);
        let k = key(1);
        let a = get(&cache, &k, &builds).await;
        let b = get(&cache, &k, &builds).await;
        assert!(Arc::ptr_eq(a.handle(), b.handle()));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        let s = cache.stats();
        assert_eq!((s.hits, s.misses, s.builds), (1, 1, 1));
    }

    #[tokio::test]
    async fn evicts_least_recently_used_idle_entry() {
        let cache = PipelineCache::<Handle>::new(2);
        let builds = AtomicU32::new(0);
        let (k1, k2, k3) = (key(1), key(2), key(3));
        drop(get(&cache, &k1, &builds).await);
        drop(get(&cache, &k2, &builds).await);
        // Touch k1 so k2 becomes the LRU.
        drop(get(&cache, &k1, &builds).await);
        drop(get(&cache, &k3, &builds).await);
        assert!(cache.contains(&k1));
        assert!(!cache.contains(&k2));
        assert!(cache.contains(&k3));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn busy_entries_are_never_evicted() {
        let cache = PipelineCache::<Handle>::new(1);
        let builds = AtomicU32::new(0);
        let (k1, k2) = (key(1), key(2));
        let held = get(&cache, &k1, &builds).await;
        let other = get(&cache, &k2, &builds).await;
        assert!(cache.contains(&k1), "in-use entry must survive");
        assert!(!other.is_cached());
        assert_eq!(cache.len(), 1);
        drop(held);
        drop(other);
        let again = get(&cache, &k2, &builds).await;
        assert!(again.is_cached());
        assert!(!cache.contains(&k1));
    }

    #[tokio::test]
    async fn failure_is_not_cached_and_retried() {
        let cache = PipelineCache::<Handle>::new(2);
        let k = key(1);
        let err = cache
            .acquire(&k, || async {
                Err::<Arc<Handle>, _>(ServeError::Internal("no model".into()))
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServeError::PipelineBuild { .. }));
        assert!(!cache.contains(&k));
        let builds = AtomicU32::new(0);
        let lease = get(&cache, &k, &builds).await;
        assert_eq!(lease.0, 0);
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_acquires_build_once() {
        let cache = Arc::new(PipelineCache::<Handle>::new(2));
        let builds = Arc::new(AtomicU32::new(0));
        let k = key(7);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let builds = builds.clone();
            let k = k.clone();
            tasks.push(tokio::spawn(async move {
                let lease = cache
                    .acquire(&k, || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        builds.fetch_add(1, Ordering::SeqCst);
                        Ok(Arc::new(Handle(42)))
                    })
                    .await
                    .unwrap();
                lease.handle().clone()
            }));
        }
        let mut handles = Vec::new();
        for t in tasks {
            handles.push(t.await.unwrap());
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[tokio::test]
    async fn cancelled_leader_hands_over() {
        let cache = Arc::new(PipelineCache::<Handle>::new(2));
        let k = key(3);
        let slow = {
            let cache = cache.clone();
            let k = k.clone();
            tokio::spawn(async move {
                cache
                    .acquire(&k, || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(Arc::new(Handle(0)))
                    })
                    .await
                    .map(|_| ())
            })
        };
        tokio::task::yield_now().await;
        slow.abort();
        let _ = slow.await;
        let builds = AtomicU32::new(0);
        let lease = tokio::time::timeout(Duration::from_secs(5), get(&cache, &k, &builds))
            .await
            .unwrap();
        assert!(lease.is_cached());
    }

    #[tokio::test]
    async fn clear_keeps_busy_entries() {
        let cache = PipelineCache::<Handle>::new(3);
        let builds = AtomicU32::new(0);
        let held = get(&cache, &key(1), &builds).await;
        drop(get(&cache, &key(2), &builds).await);
        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.len(), 1);
        drop(held);
    }
}
