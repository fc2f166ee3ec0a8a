//! Task registry: the single source of truth for task state.
//!
//! ## Locking model
//!
//! Every task lives in its own entry (`DashMap` shard + per-task mutex), so
//! operations on distinct ids never contend. Transitions for one id are
//! serialised by that task's mutex and the resulting snapshot is published
//! on the task's broadcast channel *while the lock is held*, which gives
//! every observer the same total order of updates.
//!
//! The pending queue (admission sequence → id) sits behind one small mutex
//! and is only used to compute queue positions. Lock order is always
//! task → pending, never the reverse.

use crate::error::ServeError;
use crate::options::OptionsKey;
use crate::task::{
    FailureKind, SubmitMode, Task, TaskFailure, TaskId, TaskMeta, TaskSnapshot, TaskStatus,
    TransitionPayload,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Per-task buffer of undelivered snapshots. Slow subscribers that fall
/// further behind resynchronise from the current state.
const EVENT_BUFFER: usize = 64;

struct TaskEntry {
    task: Mutex<Task>,
    events: broadcast::Sender<TaskSnapshot>,
}

/// Authoritative store of task records and their lifecycle state.
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
    pending: Mutex<BTreeMap<u64, TaskId>>,
    next_seq: AtomicU64,
    consistency_errors: AtomicU64,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Illegal transitions attempted since start. Anything above zero is a bug.
    pub consistency_errors: u64,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            pending: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(1),
            consistency_errors: AtomicU64::new(0),
        }
    }

    /// Admit a new task in `pending` state. Visible to queries immediately.
    pub fn create(&self, options_key: OptionsKey, mode: SubmitMode) -> TaskSnapshot {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = Task::new(seq, options_key, mode);
        let id = task.id.clone();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let entry = Arc::new(TaskEntry {
            task: Mutex::new(task),
            events,
        });

        let guard = entry.task.lock();
        self.tasks.insert(id.clone(), entry.clone());
        let position = {
            let mut pending = self.pending.lock();
            pending.insert(seq, id.clone());
            pending.range(..seq).count()
        };
        debug!("Task {} admitted (seq {}, position {})", id, seq, position);
        guard.snapshot(Some(position))
    }

    /// Clone of the full task record.
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        let entry = self.entry(id)?;
        let task = entry.task.lock().clone();
        Some(task)
    }

    /// Current snapshot including queue position.
    pub fn snapshot(&self, id: &TaskId) -> Option<TaskSnapshot> {
        let entry = self.entry(id)?;
        let task = entry.task.lock();
        Some(self.snapshot_locked(&task))
    }

    /// Atomically take the current snapshot and subscribe to later ones.
    ///
    /// No update can slip between the two because publishing happens under
    /// the same lock.
    pub fn watch(
        &self,
        id: &TaskId,
    ) -> Result<(TaskSnapshot, broadcast::Receiver<TaskSnapshot>), ServeError> {
        let entry = self.entry(id).ok_or_else(|| ServeError::TaskNotFound {
            task_id: id.clone(),
        })?;
        let task = entry.task.lock();
        let rx = entry.events.subscribe();
        Ok((self.snapshot_locked(&task), rx))
    }

    /// Move a task to `to`, applying `payload`.
    ///
    /// Rejects illegal edges with [`ServeError::Consistency`] (logged and
    /// counted) and writes to watchdog-abandoned tasks with
    /// [`ServeError::Abandoned`].
    pub fn transition(
        &self,
        id: &TaskId,
        to: TaskStatus,
        payload: TransitionPayload,
    ) -> Result<TaskSnapshot, ServeError> {
        self.apply(id, to, payload, false)?.ok_or_else(|| {
            ServeError::Internal(format!("transition of task {id} to {to} was skipped"))
        })
    }

    /// Close a task with a terminal `to`, unless it is already terminal.
    ///
    /// Returns `Ok(None)` when the task had already finished (including
    /// tasks expired by the watchdog). Engines with two completion paths use
    /// this so that the slower path finding the task closed is not counted
    /// as a consistency error.
    pub fn close(
        &self,
        id: &TaskId,
        to: TaskStatus,
        payload: TransitionPayload,
    ) -> Result<Option<TaskSnapshot>, ServeError> {
        debug_assert!(to.is_terminal());
        self.apply(id, to, payload, true)
    }

    fn apply(
        &self,
        id: &TaskId,
        to: TaskStatus,
        payload: TransitionPayload,
        skip_if_finished: bool,
    ) -> Result<Option<TaskSnapshot>, ServeError> {
        let entry = self.entry(id).ok_or_else(|| ServeError::TaskNotFound {
            task_id: id.clone(),
        })?;

        let (snapshot, left_queue) = {
            let mut task = entry.task.lock();
            let from = task.status;
            if skip_if_finished && from.is_terminal() {
                debug!("Task {} already {}; {} ignored", id, from, to);
                return Ok(None);
            }
            if task.abandoned {
                debug!("Discarding {} -> {} for abandoned task {}", from, to, id);
                return Err(ServeError::Abandoned { task_id: id.clone() });
            }
            if !from.can_transition_to(&to) {
                self.consistency_errors.fetch_add(1, Ordering::Relaxed);
                error!("Consistency error: task {} attempted {} -> {}", id, from, to);
                return Err(ServeError::Consistency {
                    task_id: id.clone(),
                    from,
                    to,
                });
            }

            let now = Utc::now();
            task.status = to;
            match to {
                TaskStatus::Started => task.started_at = Some(now),
                TaskStatus::Success | TaskStatus::Failure => task.finished_at = Some(now),
                TaskStatus::Pending => {}
            }
            if let Some(meta) = payload.meta {
                task.meta = Some(meta);
            }
            if payload.result_status.is_some() {
                task.result_status = payload.result_status;
            }
            if to == TaskStatus::Failure {
                task.failure = Some(payload.failure.unwrap_or_else(|| {
                    TaskFailure::new(FailureKind::Internal, "task failed without detail")
                }));
            }

            let left_queue = from == TaskStatus::Pending;
            if left_queue {
                self.pending.lock().remove(&task.seq);
            }
            let snapshot = self.snapshot_locked(&task);
            // No receivers is fine.
            let _ = entry.events.send(snapshot.clone());
            debug!("Task {}: {} -> {}", id, from, to);
            (snapshot, left_queue.then_some(task.seq))
        };

        if let Some(seq) = left_queue {
            self.notify_queue_positions(seq);
        }
        Ok(Some(snapshot))
    }

    /// Mutate the progress counters of a running task and publish the result.
    pub fn update_meta<F>(&self, id: &TaskId, update: F) -> Result<TaskSnapshot, ServeError>
    where
        F: FnOnce(&mut Option<TaskMeta>) -> Result<(), ServeError>,
    {
        let entry = self.entry(id).ok_or_else(|| ServeError::TaskNotFound {
            task_id: id.clone(),
        })?;
        let mut task = entry.task.lock();
        if task.abandoned {
            return Err(ServeError::Abandoned { task_id: id.clone() });
        }
        if task.status.is_terminal() {
            return Err(ServeError::InvalidProgress(format!(
                "task {} already finished with {}",
                id, task.status
            )));
        }
        update(&mut task.meta)?;
        let snapshot = self.snapshot_locked(&task);
        let _ = entry.events.send(snapshot.clone());
        Ok(snapshot)
    }

    /// Force a non-terminal task to `failure` and mark it abandoned.
    ///
    /// Returns `Ok(false)` when the task had already finished. Used by the
    /// watchdog, which must win even against an unresponsive worker.
    pub fn expire(&self, id: &TaskId, failure: TaskFailure) -> Result<bool, ServeError> {
        let entry = self.entry(id).ok_or_else(|| ServeError::TaskNotFound {
            task_id: id.clone(),
        })?;
        let left_queue = {
            let mut task = entry.task.lock();
            if task.status.is_terminal() {
                return Ok(false);
            }
            let from = task.status;
            task.status = TaskStatus::Failure;
            task.failure = Some(failure);
            task.abandoned = true;
            task.finished_at = Some(Utc::now());
            let left_queue = from == TaskStatus::Pending;
            if left_queue {
                self.pending.lock().remove(&task.seq);
            }
            let _ = entry.events.send(self.snapshot_locked(&task));
            warn!("Task {} expired while {}", id, from);
            left_queue.then_some(task.seq)
        };
        if let Some(seq) = left_queue {
            self.notify_queue_positions(seq);
        }
        Ok(true)
    }

    /// Number of tasks not yet started.
    pub fn list_pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop a task record. Subscribers see their stream close.
    pub fn remove(&self, id: &TaskId) -> Option<Task> {
        let (_, entry) = self.tasks.remove(id)?;
        let task = entry.task.lock().clone();
        self.pending.lock().remove(&task.seq);
        Some(task)
    }

    /// Ids of terminal tasks that finished before `cutoff`.
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter_map(|item| {
                let task = item.value().task.lock();
                match task.finished_at {
                    Some(at) if task.status.is_terminal() && at < cutoff => Some(task.id.clone()),
                    _ => None,
                }
            })
            .collect()
    }

    /// Live receivers on the task's event channel.
    pub fn observer_count(&self, id: &TaskId) -> usize {
        self.entry(id).map_or(0, |e| e.events.receiver_count())
    }

    /// Re-publish every pending task's snapshot so watchers see fresh
    /// queue positions.
    pub fn republish_pending(&self) {
        self.notify_queue_positions(0);
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            consistency_errors: self.consistency_errors.load(Ordering::Relaxed),
            ..RegistryStats::default()
        };
        for item in self.tasks.iter() {
            stats.total += 1;
            match item.value().task.lock().status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Started => stats.started += 1,
                TaskStatus::Success => stats.succeeded += 1,
                TaskStatus::Failure => stats.failed += 1,
            }
        }
        stats
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn entry(&self, id: &TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks.get(id).map(|e| e.value().clone())
    }

    fn snapshot_locked(&self, task: &Task) -> TaskSnapshot {
        let position = if task.status == TaskStatus::Pending {
            Some(self.pending.lock().range(..task.seq).count())
        } else {
            None
        };
        task.snapshot(position)
    }

    /// Publish new positions to watchers of tasks queued behind `seq`.
    fn notify_queue_positions(&self, seq: u64) {
        let behind: Vec<TaskId> = self
            .pending
            .lock()
            .range(seq..)
            .map(|(_, id)| id.clone())
            .collect();
        for id in behind {
            let Some(entry) = self.entry(&id) else { continue };
            if entry.events.receiver_count() == 0 {
                continue;
            }
            let task = entry.task.lock();
            if task.status == TaskStatus::Pending {
                let _ = entry.events.send(self.snapshot_locked(&task));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{canonicalize, ConversionOptions};
    use crate::output::ConversionStatus;

    fn key() -> OptionsKey {
        canonicalize(&ConversionOptions::default()).unwrap()
    }

    fn registry_with(n: usize) -> (TaskRegistry, Vec<TaskId>) {
        let reg = TaskRegistry::new();
        let ids = (0..n)
            .map(|_| reg.create(key(), SubmitMode::Async).task_id)
            .collect();
        (reg, ids)
    }

    #[test]
    fn created_task_is_visible_and_pending() {
        let (reg, ids) = registry_with(1);
        let t = reg.get(&ids[0]).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(reg.list_pending_count(), 1);
    }

    #[test]
    fn queue_position_counts_earlier_pending_tasks() {
        let (reg, ids) = registry_with(3);
        assert_eq!(reg.snapshot(&ids[0]).unwrap().task_position, Some(0));
        assert_eq!(reg.snapshot(&ids[2]).unwrap().task_position, Some(2));

        reg.transition(&ids[0], TaskStatus::Started, TransitionPayload::none())
            .unwrap();
        assert_eq!(reg.snapshot(&ids[0]).unwrap().task_position, None);
        assert_eq!(reg.snapshot(&ids[2]).unwrap().task_position, Some(1));
    }

    #[test]
    fn full_lifecycle() {
        let (reg, ids) = registry_with(1);
        let id = &ids[0];
        reg.transition(id, TaskStatus::Started, TransitionPayload::started(TaskMeta::with_docs(2)))
            .unwrap();
        let snap = reg
            .transition(
                id,
                TaskStatus::Success,
                TransitionPayload::completed(ConversionStatus::Success),
            )
            .unwrap();
        assert_eq!(snap.task_status, TaskStatus::Success);
        assert_eq!(snap.task_result_status, Some(ConversionStatus::Success));
        let task = reg.get(id).unwrap();
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn illegal_transition_is_a_counted_consistency_error() {
        let (reg, ids) = registry_with(1);
        let id = &ids[0];
        let err = reg
            .transition(id, TaskStatus::Success, TransitionPayload::none())
            .unwrap_err();
        assert!(matches!(err, ServeError::Consistency { .. }));
        assert_eq!(reg.stats().consistency_errors, 1);
        // State untouched.
        assert_eq!(reg.get(id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn duplicate_terminal_transition_rejected() {
        let (reg, ids) = registry_with(1);
        let id = &ids[0];
        reg.transition(id, TaskStatus::Started, TransitionPayload::none()).unwrap();
        reg.transition(id, TaskStatus::Success, TransitionPayload::none()).unwrap();
        assert!(reg
            .transition(id, TaskStatus::Failure, TransitionPayload::none())
            .is_err());
        assert_eq!(reg.get(id).unwrap().status, TaskStatus::Success);
    }

    #[test]
    fn closing_a_finished_task_is_a_quiet_no_op() {
        let (reg, ids) = registry_with(1);
        let id = &ids[0];
        reg.transition(id, TaskStatus::Started, TransitionPayload::none()).unwrap();
        let closed = reg
            .close(id, TaskStatus::Success, TransitionPayload::none())
            .unwrap();
        assert_eq!(closed.unwrap().task_status, TaskStatus::Success);

        let again = reg
            .close(
                id,
                TaskStatus::Failure,
                TransitionPayload::failed(TaskFailure::new(FailureKind::Remote, "late")),
            )
            .unwrap();
        assert!(again.is_none());
        assert_eq!(reg.get(id).unwrap().status, TaskStatus::Success);
        assert_eq!(reg.stats().consistency_errors, 0);
    }

    #[test]
    fn pending_to_failure_allowed_for_admission_faults() {
        let (reg, ids) = registry_with(1);
        let snap = reg
            .transition(
                &ids[0],
                TaskStatus::Failure,
                TransitionPayload::failed(TaskFailure::new(FailureKind::Capacity, "queue full")),
            )
            .unwrap();
        assert_eq!(snap.task_error.unwrap().kind, FailureKind::Capacity);
        assert_eq!(reg.list_pending_count(), 0);
    }

    #[test]
    fn expire_abandons_and_blocks_late_writes() {
        let (reg, ids) = registry_with(1);
        let id = &ids[0];
        reg.transition(id, TaskStatus::Started, TransitionPayload::none()).unwrap();
        assert!(reg
            .expire(id, TaskFailure::new(FailureKind::Timeout, "too slow"))
            .unwrap());
        let err = reg
            .transition(id, TaskStatus::Success, TransitionPayload::none())
            .unwrap_err();
        assert!(matches!(err, ServeError::Abandoned { .. }));
        // Late completion is not a consistency bug.
        assert_eq!(reg.stats().consistency_errors, 0);
        // Already terminal: nothing to expire.
        assert!(!reg
            .expire(id, TaskFailure::new(FailureKind::Timeout, "again"))
            .unwrap());
    }

    #[test]
    fn watch_sees_every_transition_in_order() {
        let (reg, ids) = registry_with(1);
        let id = &ids[0];
        let (first, mut rx) = reg.watch(id).unwrap();
        assert_eq!(first.task_status, TaskStatus::Pending);
        reg.transition(id, TaskStatus::Started, TransitionPayload::none()).unwrap();
        reg.transition(id, TaskStatus::Failure, TransitionPayload::none()).unwrap();
        assert_eq!(rx.try_recv().unwrap().task_status, TaskStatus::Started);
        assert_eq!(rx.try_recv().unwrap().task_status, TaskStatus::Failure);
    }

    #[test]
    fn waiting_tasks_receive_position_updates() {
        let (reg, ids) = registry_with(2);
        let (_, mut rx) = reg.watch(&ids[1]).unwrap();
        reg.transition(&ids[0], TaskStatus::Started, TransitionPayload::none())
            .unwrap();
        let update = rx.try_recv().unwrap();
        assert_eq!(update.task_status, TaskStatus::Pending);
        assert_eq!(update.task_position, Some(0));
    }

    #[test]
    fn meta_update_requires_live_task() {
        let (reg, ids) = registry_with(1);
        let id = &ids[0];
        reg.transition(id, TaskStatus::Started, TransitionPayload::started(TaskMeta::with_docs(1)))
            .unwrap();
        let snap = reg
            .update_meta(id, |m| {
                if let Some(m) = m {
                    m.record(true);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(snap.task_meta.unwrap().num_succeeded, 1);
        reg.transition(id, TaskStatus::Success, TransitionPayload::none()).unwrap();
        assert!(matches!(
            reg.update_meta(id, |_| Ok(())),
            Err(ServeError::InvalidProgress(_))
        ));
    }

    #[test]
    fn unknown_ids() {
        let reg = TaskRegistry::new();
        let id = TaskId::from("missing");
        assert!(reg.get(&id).is_none());
        assert!(matches!(reg.watch(&id), Err(ServeError::TaskNotFound { .. })));
        assert!(matches!(
            reg.transition(&id, TaskStatus::Started, TransitionPayload::none()),
            Err(ServeError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn remove_and_finished_before() {
        let (reg, ids) = registry_with(2);
        reg.transition(&ids[0], TaskStatus::Failure, TransitionPayload::none())
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(reg.finished_before(later), vec![ids[0].clone()]);
        assert!(reg.remove(&ids[1]).is_some());
        assert_eq!(reg.list_pending_count(), 0);
        assert_eq!(reg.stats().total, 1);
    }
}
