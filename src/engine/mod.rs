//! Execution engines: where admitted tasks actually run.
//!
//! ## Why a tagged enum and not a trait object?
//!
//! There are exactly two engines and the set is closed. The orchestrator
//! needs a few engine-specific extras (the remote engine accepts progress
//! callbacks), which an enum exposes without downcasting.
//!
//! Both variants close the loop the same way: every state change goes
//! through [`TaskRegistry::transition`](crate::registry::TaskRegistry::transition),
//! so nothing downstream knows which engine produced it.
//!
//! ```text
//!  orchestrator.submit ──▶ Engine::submit ──┬──▶ local: FIFO queue ──▶ workers ──┐
//!                                           └──▶ remote: POST job ──▶ callbacks ─┤
//!                                                                   or polling  │
//!                             TaskRegistry.transition ◀─────────────────────────┘
//! ```

pub mod local;
pub mod remote;

use crate::error::ServeError;
use crate::options::{ConversionOptions, OptionsKey};
use crate::pipeline::DocumentSource;
use crate::registry::TaskRegistry;
use crate::task::{FailureKind, TaskFailure, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

pub use local::LocalEngine;
pub use remote::{
    CallbackAck, HttpRemoteOrchestrator, ProgressCallback, ProgressUpdate, RemoteEngine,
    RemoteJob, RemoteJobState, RemoteJobStatus, RemoteOrchestrator,
};

/// An admitted task, handed to an engine.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: TaskId,
    pub options: Arc<ConversionOptions>,
    pub key: OptionsKey,
    pub sources: Vec<DocumentSource>,
    /// Processing budget; the watchdog fails the task once it is spent.
    pub timeout: Duration,
}

/// The engine selected at start-up.
pub enum Engine {
    Local(LocalEngine),
    Remote(RemoteEngine),
}

impl Engine {
    /// Hand a task to the engine. The task is already `pending` in the
    /// registry; on `Err` the caller fails it.
    pub async fn submit(&self, task: QueuedTask) -> Result<(), ServeError> {
        match self {
            Engine::Local(engine) => engine.submit(task),
            Engine::Remote(engine) => engine.submit(task).await,
        }
    }

    /// Spawn background loops (workers, status polling).
    pub fn start(&self) {
        match self {
            Engine::Local(engine) => engine.start(),
            Engine::Remote(engine) => engine.start(),
        }
    }

    /// Stop background loops and wait for them to exit.
    pub async fn shutdown(&self) {
        match self {
            Engine::Local(engine) => engine.shutdown().await,
            Engine::Remote(engine) => engine.shutdown().await,
        }
    }

    /// Tasks accepted by the engine but not yet picked up.
    pub fn queue_size(&self) -> usize {
        match self {
            Engine::Local(engine) => engine.queue_size(),
            Engine::Remote(engine) => engine.queue_size(),
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteEngine> {
        match self {
            Engine::Remote(engine) => Some(engine),
            Engine::Local(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Engine::Local(_) => "local",
            Engine::Remote(_) => "remote",
        }
    }
}

// ── Watchdog ─────────────────────────────────────────────────────────────

/// Fail `id` with a timeout once `timeout` has elapsed.
///
/// Runs as its own task so it fires even when the worker is stuck inside a
/// blocking conversion. `on_expire` runs only when the watchdog wins: the
/// local engine uses it to tell the worker to drop its in-flight work, the
/// remote engine to forget the job. Abort the returned handle when the task
/// finishes first.
pub(crate) fn spawn_watchdog<F>(
    registry: Arc<TaskRegistry>,
    id: TaskId,
    timeout: Duration,
    on_expire: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let failure = TaskFailure::new(
            FailureKind::Timeout,
            format!("task exceeded the maximum processing time of {}s", timeout.as_secs()),
        );
        match registry.expire(&id, failure) {
            Ok(true) => {
                warn!("Task {} timed out after {}s", id, timeout.as_secs());
                on_expire();
            }
            Ok(false) => {}
            Err(e) => warn!("Watchdog for task {}: {}", id, e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{SubmitMode, TaskStatus, TransitionPayload, TaskMeta};
    use tokio::sync::oneshot;

    fn key() -> OptionsKey {
        crate::options::canonicalize(&ConversionOptions::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fails_a_stuck_task() {
        let registry = Arc::new(TaskRegistry::new());
        let id = registry.create(key(), SubmitMode::Async).task_id;
        registry
            .transition(&id, TaskStatus::Started, TransitionPayload::started(TaskMeta::with_docs(1)))
            .unwrap();
        let (tx, rx) = oneshot::channel();
        spawn_watchdog(registry.clone(), id.clone(), Duration::from_secs(10), move || {
            let _ = tx.send(());
        });

        rx.await.unwrap();
        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert!(task.abandoned);
        assert_eq!(task.failure.unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_leaves_finished_tasks_alone() {
        let registry = Arc::new(TaskRegistry::new());
        let id = registry.create(key(), SubmitMode::Async).task_id;
        registry
            .transition(&id, TaskStatus::Started, TransitionPayload::none())
            .unwrap();
        registry
            .transition(
                &id,
                TaskStatus::Success,
                TransitionPayload::completed(crate::output::ConversionStatus::Success),
            )
            .unwrap();
        let (tx, rx) = oneshot::channel();
        let watchdog = spawn_watchdog(registry.clone(), id.clone(), Duration::from_secs(1), move || {
            let _ = tx.send(());
        });
        watchdog.await.unwrap();
        assert!(rx.await.is_err(), "no cancel for a finished task");
        assert_eq!(registry.get(&id).unwrap().status, TaskStatus::Success);
    }
}
