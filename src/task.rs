//! Task model: identifiers, lifecycle states and the views handed to callers.
//!
//! A [`Task`] is the registry's private record. Callers only ever see
//! [`TaskSnapshot`]s (poll responses) and [`TaskEvent`]s (subscription
//! messages), both cheap clones taken under the task's lock.

use crate::options::OptionsKey;
use crate::output::ConversionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique task identifier, assigned at admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────────

/// Lifecycle state of a task.
///
/// ```text
/// pending ──► started ──► success
///    │           │
///    └───────────┴──────► failure
/// ```
///
/// `pending -> failure` covers admission-time faults (queue full, remote
/// submission refused). Terminal states have no outgoing edges.
///
/// # Examples
///
/// ```
/// use docserve::TaskStatus;
///
/// assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Started));
/// assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Failure));
/// assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Success));
/// assert!(!TaskStatus::Success.can_transition_to(&TaskStatus::Failure));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Returns `true` if moving from this status to `next` is a legal edge.
    /// Self-transitions are rejected.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Started | Self::Failure),
            Self::Started => matches!(next, Self::Success | Self::Failure),
            Self::Success | Self::Failure => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Started => write!(f, "started"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// How the caller submitted the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    Sync,
    Async,
}

/// Progress counters, written only by the executing engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub num_docs: usize,
    pub num_processed: usize,
    pub num_succeeded: usize,
    pub num_failed: usize,
}

impl TaskMeta {
    pub fn with_docs(num_docs: usize) -> Self {
        Self {
            num_docs,
            ..Self::default()
        }
    }

    /// Record one more processed document.
    pub fn record(&mut self, succeeded: bool) {
        self.num_processed += 1;
        if succeeded {
            self.num_succeeded += 1;
        } else {
            self.num_failed += 1;
        }
    }
}

/// Why a task ended in `failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Conversion,
    Timeout,
    Capacity,
    PipelineBuild,
    Remote,
    Internal,
}

/// Structured failure detail carried by a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Data attached to a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionPayload {
    /// Replace the progress counters.
    pub meta: Option<TaskMeta>,
    /// Overall status of the stored result bundle, if one was produced.
    pub result_status: Option<ConversionStatus>,
    /// Failure detail; only meaningful for `failure`.
    pub failure: Option<TaskFailure>,
}

impl TransitionPayload {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn started(meta: TaskMeta) -> Self {
        Self {
            meta: Some(meta),
            ..Self::default()
        }
    }

    pub fn completed(result_status: ConversionStatus) -> Self {
        Self {
            result_status: Some(result_status),
            ..Self::default()
        }
    }

    pub fn failed(failure: TaskFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn with_result_status(mut self, status: ConversionStatus) -> Self {
        self.result_status = Some(status);
        self
    }
}

// ── Records ──────────────────────────────────────────────────────────────

/// The registry's record of one admitted request.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Admission sequence number; orders the pending queue.
    pub seq: u64,
    pub status: TaskStatus,
    pub mode: SubmitMode,
    pub options_key: OptionsKey,
    pub meta: Option<TaskMeta>,
    pub result_status: Option<ConversionStatus>,
    pub failure: Option<TaskFailure>,
    /// Forced to `failure` by the watchdog; later writes are discarded.
    pub abandoned: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(seq: u64, options_key: OptionsKey, mode: SubmitMode) -> Self {
        Self {
            id: TaskId::new(),
            seq,
            status: TaskStatus::Pending,
            mode,
            options_key,
            meta: None,
            result_status: None,
            failure: None,
            abandoned: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn snapshot(&self, position: Option<usize>) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            task_status: self.status,
            task_position: if self.status == TaskStatus::Pending {
                position
            } else {
                None
            },
            task_meta: self.meta,
            task_result_status: self.result_status,
            task_error: self.failure.clone(),
        }
    }
}

/// Point-in-time view of a task, as returned by the status API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub task_status: TaskStatus,
    /// Number of pending tasks admitted earlier. Only set while pending.
    pub task_position: Option<usize>,
    pub task_meta: Option<TaskMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_result_status: Option<ConversionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_error: Option<TaskFailure>,
}

impl TaskSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.task_status.is_terminal()
    }
}

/// Kind of a subscription message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Connection,
    Update,
    Error,
}

/// One message on a task subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub message: MessageKind,
    pub task: Option<TaskSnapshot>,
    pub error: Option<String>,
}

impl TaskEvent {
    pub fn connection(task: TaskSnapshot) -> Self {
        Self {
            message: MessageKind::Connection,
            task: Some(task),
            error: None,
        }
    }

    pub fn update(task: TaskSnapshot) -> Self {
        Self {
            message: MessageKind::Update,
            task: Some(task),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            message: MessageKind::Error,
            task: None,
            error: Some(error.into()),
        }
    }
}
