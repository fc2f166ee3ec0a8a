//! Status distribution: long-poll and push subscriptions over registry state.
//!
//! ## Why per-subscriber receivers?
//!
//! Each observer owns its own broadcast receiver on the task's channel. A
//! slow WebSocket client only delays itself: the registry's `send` never
//! waits, and a receiver that falls behind the buffer resynchronises from
//! the task's current snapshot instead of stalling the worker.
//!
//! Poll and subscribe both start from [`TaskRegistry::watch`], which takes the
//! current snapshot and the receiver atomically, so an update can never be
//! lost between "read state" and "start listening".

use crate::error::ServeError;
use crate::registry::TaskRegistry;
use crate::task::{TaskEvent, TaskId, TaskSnapshot, TaskStatus};
use futures::stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::debug;

/// A boxed stream of subscription events for one task.
pub type TaskEventStream = Pin<Box<dyn Stream<Item = TaskEvent> + Send>>;

/// Turns registry transitions into poll responses and push streams.
#[derive(Clone)]
pub struct StatusDistributor {
    registry: Arc<TaskRegistry>,
}

impl StatusDistributor {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    /// Long-poll the task's status.
    ///
    /// `max_wait = 0` answers immediately. Otherwise waits until the task's
    /// status changes or `max_wait` elapses, then returns the snapshot as it
    /// stands (possibly unchanged).
    pub async fn poll(&self, id: &TaskId, max_wait: Duration) -> Result<TaskSnapshot, ServeError> {
        let (current, rx) = self.registry.watch(id)?;
        if max_wait.is_zero() || current.is_terminal() {
            return Ok(current);
        }
        let initial = current.task_status;
        self.wait_until(id, current, rx, max_wait, |s| s != initial)
            .await
    }

    /// Wait until the task is terminal or `max_wait` elapses.
    pub async fn wait_terminal(
        &self,
        id: &TaskId,
        max_wait: Duration,
    ) -> Result<TaskSnapshot, ServeError> {
        let (current, rx) = self.registry.watch(id)?;
        if current.is_terminal() || max_wait.is_zero() {
            return Ok(current);
        }
        self.wait_until(id, current, rx, max_wait, |s| s.is_terminal())
            .await
    }

    async fn wait_until<F>(
        &self,
        id: &TaskId,
        mut latest: TaskSnapshot,
        mut rx: broadcast::Receiver<TaskSnapshot>,
        max_wait: Duration,
        done: F,
    ) -> Result<TaskSnapshot, ServeError>
    where
        F: Fn(TaskStatus) -> bool,
    {
        let deadline = Instant::now() + max_wait;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(snapshot)) => {
                    let finished = done(snapshot.task_status);
                    latest = snapshot;
                    if finished {
                        return Ok(latest);
                    }
                }
                Ok(Err(RecvError::Lagged(n))) => {
                    debug!("Poller for {} lagged by {} updates", id, n);
                    if let Some(snapshot) = self.registry.snapshot(id) {
                        let finished = done(snapshot.task_status);
                        latest = snapshot;
                        if finished {
                            return Ok(latest);
                        }
                    }
                }
                // Task record dropped while waiting.
                Ok(Err(RecvError::Closed)) => {
                    return self.registry.snapshot(id).ok_or_else(|| {
                        ServeError::TaskNotFound {
                            task_id: id.clone(),
                        }
                    })
                }
                Err(_elapsed) => return Ok(self.registry.snapshot(id).unwrap_or(latest)),
            }
        }
    }

    /// Subscribe to the task's event stream.
    ///
    /// Yields one `connection` event with the current snapshot, then an
    /// `update` per registry change until a terminal snapshot has been
    /// delivered, then ends. A task that is already terminal yields exactly
    /// the `connection` event.
    pub fn subscribe(&self, id: &TaskId) -> Result<TaskEventStream, ServeError> {
        let (current, rx) = self.registry.watch(id)?;
        let state = SubscriptionState::Connecting {
            current,
            rx,
            registry: self.registry.clone(),
            id: id.clone(),
        };
        Ok(Box::pin(stream::unfold(state, next_event)))
    }

    /// Number of live receivers for a task (subscribers plus pollers).
    pub fn observer_count(&self, id: &TaskId) -> usize {
        self.registry.observer_count(id)
    }
}

enum SubscriptionState {
    Connecting {
        current: TaskSnapshot,
        rx: broadcast::Receiver<TaskSnapshot>,
        registry: Arc<TaskRegistry>,
        id: TaskId,
    },
    Live {
        rx: broadcast::Receiver<TaskSnapshot>,
        registry: Arc<TaskRegistry>,
        id: TaskId,
    },
    Done,
}

async fn next_event(state: SubscriptionState) -> Option<(TaskEvent, SubscriptionState)> {
    match state {
        SubscriptionState::Connecting {
            current,
            rx,
            registry,
            id,
        } => {
            let next = if current.is_terminal() {
                SubscriptionState::Done
            } else {
                SubscriptionState::Live { rx, registry, id }
            };
            Some((TaskEvent::connection(current), next))
        }
        SubscriptionState::Live {
            mut rx,
            registry,
            id,
        } => {
            let snapshot = match rx.recv().await {
                Ok(snapshot) => snapshot,
                Err(RecvError::Lagged(n)) => {
                    debug!("Subscriber for {} lagged by {} updates, resyncing", id, n);
                    match registry.snapshot(&id) {
                        Some(snapshot) => snapshot,
                        None => {
                            return Some((TaskEvent::error("Task not found."), SubscriptionState::Done))
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    return Some((TaskEvent::error("Task was removed."), SubscriptionState::Done))
                }
            };
            let next = if snapshot.is_terminal() {
                SubscriptionState::Done
            } else {
                SubscriptionState::Live { rx, registry, id }
            };
            Some((TaskEvent::update(snapshot), next))
        }
        SubscriptionState::Done => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{canonicalize, ConversionOptions};
    use crate::task::{MessageKind, SubmitMode, TransitionPayload};
    use futures::StreamExt;

    fn setup() -> (Arc<TaskRegistry>, StatusDistributor, TaskId) {
        let reg = Arc::new(TaskRegistry::new());
        let key = canonicalize(&ConversionOptions::default()).unwrap();
        let id = reg.create(key, SubmitMode::Async).task_id;
        (reg.clone(), StatusDistributor::new(reg), id)
    }

    #[tokio::test]
    async fn zero_wait_poll_is_immediate() {
        let (_reg, dist, id) = setup();
        let snap = tokio::time::timeout(Duration::from_millis(50), dist.poll(&id, Duration::ZERO))
            .await
            .expect("poll with max_wait=0 must not block")
            .unwrap();
        assert_eq!(snap.task_status, TaskStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_with_unchanged_snapshot() {
        let (_reg, dist, id) = setup();
        let snap = dist.poll(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(snap.task_status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn poll_wakes_on_transition() {
        let (reg, dist, id) = setup();
        let waiter = {
            let dist = dist.clone();
            let id = id.clone();
            tokio::spawn(async move { dist.poll(&id, Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        while dist.observer_count(&id) == 0 {
            tokio::task::yield_now().await;
        }
        reg.transition(&id, TaskStatus::Started, TransitionPayload::none())
            .unwrap();
        let snap = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snap.task_status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn subscription_after_terminal_yields_only_connection() {
        let (reg, dist, id) = setup();
        reg.transition(&id, TaskStatus::Started, TransitionPayload::none()).unwrap();
        reg.transition(&id, TaskStatus::Success, TransitionPayload::none()).unwrap();

        let events: Vec<TaskEvent> = dist.subscribe(&id).unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, MessageKind::Connection);
        assert_eq!(events[0].task.as_ref().unwrap().task_status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn subscription_follows_lifecycle_then_closes() {
        let (reg, dist, id) = setup();
        let stream = dist.subscribe(&id).unwrap();
        reg.transition(&id, TaskStatus::Started, TransitionPayload::none()).unwrap();
        reg.transition(&id, TaskStatus::Failure, TransitionPayload::none()).unwrap();

        let events: Vec<TaskEvent> = stream.collect().await;
        let kinds: Vec<MessageKind> = events.iter().map(|e| e.message).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::Connection, MessageKind::Update, MessageKind::Update]
        );
        let statuses: Vec<TaskStatus> = events
            .iter()
            .map(|e| e.task.as_ref().unwrap().task_status)
            .collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Pending, TaskStatus::Started, TaskStatus::Failure]
        );
    }

    #[tokio::test]
    async fn many_subscribers_each_get_every_event() {
        let (reg, dist, id) = setup();
        let streams: Vec<_> = (0..16).map(|_| dist.subscribe(&id).unwrap()).collect();
        reg.transition(&id, TaskStatus::Started, TransitionPayload::none()).unwrap();
        reg.transition(&id, TaskStatus::Success, TransitionPayload::none()).unwrap();
        for s in streams {
            let events: Vec<TaskEvent> = s.collect().await;
            assert_eq!(events.len(), 3);
        }
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (_reg, dist, _id) = setup();
        let missing = TaskId::from("nope");
        assert!(matches!(
            dist.poll(&missing, Duration::ZERO).await,
            Err(ServeError::TaskNotFound { .. })
        ));
        assert!(dist.subscribe(&missing).is_err());
    }
}
