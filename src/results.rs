//! Result store: holds finished bundles and enforces the consumption policy.
//!
//! Two policies:
//!
//! * **single-use**: the first successful read marks the bundle consumed
//!   and schedules its deletion after `removal_delay`. Reads inside that
//!   grace window return the same bundle (a client retrying after a dropped
//!   response still gets its data); reads after it see "not found".
//! * **persistent**: bundles stay until explicitly deleted or until
//!   `max_retention` (when configured) has passed since they were stored.
//!
//! Every decision to delete an entry goes through `DashMap::remove_if`
//! on the entry's own shard, so concurrent `get`/`delete`/sweep calls
//! agree on a single winner and a bundle is never served mid-deletion.

use crate::error::ServeError;
use crate::output::ResultBundle;
use crate::task::TaskId;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// How long results live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub single_use: bool,
    pub removal_delay: Duration,
    pub max_retention: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            single_use: true,
            removal_delay: Duration::from_secs(300),
            max_retention: None,
        }
    }
}

struct StoredResult {
    bundle: Arc<ResultBundle>,
    stored_at: Instant,
    consumed_at: Option<Instant>,
    /// Distinguishes re-puts under the same id from the entry a deletion
    /// timer was scheduled for.
    generation: u64,
}

impl StoredResult {
    fn expired(&self, policy: &RetentionPolicy, now: Instant) -> bool {
        if let Some(max) = policy.max_retention {
            if now.duration_since(self.stored_at) >= max {
                return true;
            }
        }
        match self.consumed_at {
            Some(at) if policy.single_use => now.duration_since(at) >= policy.removal_delay,
            _ => false,
        }
    }
}

/// Report of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: Vec<TaskId>,
    pub remaining: usize,
}

/// Concurrent store of finished task bundles.
pub struct ResultStore {
    entries: Arc<DashMap<TaskId, StoredResult>>,
    policy: RetentionPolicy,
    generation: AtomicU64,
}

impl ResultStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            policy,
            generation: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Store the bundle for `id`, replacing any previous one.
    pub fn put(&self, id: TaskId, bundle: ResultBundle) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        debug!("Storing result for task {}", id);
        self.entries.insert(
            id,
            StoredResult {
                bundle: Arc::new(bundle),
                stored_at: Instant::now(),
                consumed_at: None,
                generation,
            },
        );
    }

    /// Read the bundle for `id`.
    ///
    /// Returns [`ServeError::ResultNotFound`] for unknown, deleted or
    /// expired ids. Under the single-use policy the first read starts the
    /// removal timer.
    pub fn get(&self, id: &TaskId) -> Result<Arc<ResultBundle>, ServeError> {
        let now = Instant::now();
        let not_found = || ServeError::ResultNotFound { task_id: id.clone() };

        let scheduled = {
            let Some(mut entry) = self.entries.get_mut(id) else {
                return Err(not_found());
            };
            if entry.expired(&self.policy, now) {
                drop(entry);
                self.entries
                    .remove_if(id, |_, stored| stored.expired(&self.policy, now));
                return Err(not_found());
            }
            let first_read = self.policy.single_use && entry.consumed_at.is_none();
            if first_read {
                entry.consumed_at = Some(now);
            }
            let bundle = entry.bundle.clone();
            (bundle, first_read.then_some(entry.generation))
        };

        let (bundle, first_read) = scheduled;
        if let Some(generation) = first_read {
            self.schedule_removal(id.clone(), generation);
        }
        Ok(bundle)
    }

    /// `true` when a live bundle exists for `id`. Does not consume it.
    pub fn contains(&self, id: &TaskId) -> bool {
        let now = Instant::now();
        self.entries
            .get(id)
            .is_some_and(|e| !e.expired(&self.policy, now))
    }

    /// Remove the bundle for `id`. Returns `true` if one was removed.
    pub fn delete(&self, id: &TaskId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Remove every bundle whose grace delay or retention has elapsed.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let candidates: Vec<TaskId> = self
            .entries
            .iter()
            .filter(|e| e.value().expired(&self.policy, now))
            .map(|e| e.key().clone())
            .collect();
        let removed = candidates
            .into_iter()
            .filter(|id| {
                self.entries
                    .remove_if(id, |_, stored| stored.expired(&self.policy, now))
                    .is_some()
            })
            .collect();
        SweepReport {
            removed,
            remaining: self.entries.len(),
        }
    }

    /// Remove bundles stored more than `age` ago, regardless of policy.
    pub fn clear_older_than(&self, age: Duration) -> Vec<TaskId> {
        let now = Instant::now();
        let old = |stored: &StoredResult| now.duration_since(stored.stored_at) >= age;
        let candidates: Vec<TaskId> = self
            .entries
            .iter()
            .filter(|e| old(e.value()))
            .map(|e| e.key().clone())
            .collect();
        candidates
            .into_iter()
            .filter(|id| self.entries.remove_if(id, |_, s| old(s)).is_some())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`ResultStore::sweep`] every `interval` until `shutdown` flips.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = store.sweep();
                        if !report.removed.is_empty() {
                            info!(
                                "Result sweep removed {} bundle(s), {} remaining",
                                report.removed.len(),
                                report.remaining
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn schedule_removal(&self, id: TaskId, generation: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Without a runtime the lazy expiry check in `get` still applies.
            return;
        };
        let entries = Arc::clone(&self.entries);
        let delay = self.policy.removal_delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if entries
                .remove_if(&id, |_, stored| stored.generation == generation)
                .is_some()
            {
                debug!("Removed consumed result for task {}", id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{DocumentContent, DocumentResult};
    use std::collections::BTreeMap;

    fn bundle() -> ResultBundle {
        ResultBundle::assemble(
            vec![DocumentResult::success("a.md", DocumentContent::default(), 0.0)],
            0.0,
            BTreeMap::new(),
            vec![],
            false,
        )
    }

    fn single_use(delay_secs: u64) -> ResultStore {
        ResultStore::new(RetentionPolicy {
            single_use: true,
            removal_delay: Duration::from_secs(delay_secs),
            max_retention: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn second_read_within_grace_returns_same_bundle() {
        let store = single_use(10);
        let id = TaskId::from("t");
        store.put(id.clone(), bundle());
        let a = store.get(&id).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let b = store.get(&id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn read_after_grace_is_not_found() {
        let store = single_use(10);
        let id = TaskId::from("t");
        store.put(id.clone(), bundle());
        store.get(&id).unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(matches!(
            store.get(&id),
            Err(ServeError::ResultNotFound { .. })
        ));
        assert!(store.is_empty(), "scheduled removal should have run");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_policy_keeps_results() {
        let store = ResultStore::new(RetentionPolicy {
            single_use: false,
            removal_delay: Duration::from_secs(1),
            max_retention: None,
        });
        let id = TaskId::from("t");
        store.put(id.clone(), bundle());
        store.get(&id).unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(store.get(&id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn max_retention_applies_without_reads() {
        let store = ResultStore::new(RetentionPolicy {
            single_use: false,
            removal_delay: Duration::from_secs(1),
            max_retention: Some(Duration::from_secs(60)),
        });
        let id = TaskId::from("t");
        store.put(id.clone(), bundle());
        tokio::time::advance(Duration::from_secs(61)).await;
        let report = store.sweep();
        assert_eq!(report.removed, vec![id.clone()]);
        assert!(store.get(&id).is_err());
    }

    #[tokio::test]
    async fn delete_is_single_winner() {
        let store = single_use(10);
        let id = TaskId::from("t");
        store.put(id.clone(), bundle());
        assert!(store.delete(&id));
        assert!(!store.delete(&id));
        assert!(store.get(&id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_remove_a_fresh_put() {
        let store = single_use(10);
        let id = TaskId::from("t");
        store.put(id.clone(), bundle());
        store.get(&id).unwrap();
        store.put(id.clone(), bundle());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_older_than_ignores_policy() {
        let store = ResultStore::new(RetentionPolicy {
            single_use: false,
            ..RetentionPolicy::default()
        });
        store.put(TaskId::from("old"), bundle());
        tokio::time::advance(Duration::from_secs(100)).await;
        store.put(TaskId::from("new"), bundle());
        let removed = store.clear_older_than(Duration::from_secs(50));
        assert_eq!(removed, vec![TaskId::from("old")]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = single_use(1);
        assert!(matches!(
            store.get(&TaskId::from("x")),
            Err(ServeError::ResultNotFound { .. })
        ));
    }
}
