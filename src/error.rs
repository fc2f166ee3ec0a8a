//! Error types for the docserve library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ServeError`]: **Fatal for the call**: the operation the caller asked
//!   for cannot be performed at all (contradictory options, full queue,
//!   unknown task id, illegal state transition). Returned as
//!   `Err(ServeError)` from the orchestrator and its components.
//!
//! * [`DocumentError`]: **Non-fatal**: one input of a multi-input task could
//!   not be fetched or converted. Stored inside
//!   [`crate::output::DocumentResult`] so callers can inspect partial
//!   success instead of losing the whole task to one bad document.
//!
//! Errors discovered after admission (conversion failures, timeouts) never
//! surface as `Err` from `submit`; they are captured in the task's terminal
//! state and read back through status or result queries.

use crate::task::{TaskId, TaskStatus};
use thiserror::Error;

/// All fatal errors returned by the docserve library.
///
/// Document-level failures use [`DocumentError`] and are stored in
/// [`crate::output::DocumentResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ServeError {
    // ── Admission errors ──────────────────────────────────────────────────
    /// Options are malformed or contradictory; the request never enters
    /// the registry.
    #[error("Invalid conversion options: {0}")]
    Validation(String),

    /// The engine cannot accept more work right now.
    #[error("Engine at capacity: {reason}")]
    Capacity { reason: String },

    // ── Lookup errors ─────────────────────────────────────────────────────
    /// No task with this id is known (never admitted or already cleaned up).
    #[error("Task '{task_id}' not found")]
    TaskNotFound { task_id: TaskId },

    /// The task exists but its result is gone or was never produced.
    #[error("Result for task '{task_id}' not found or expired")]
    ResultNotFound { task_id: TaskId },

    /// The task has not reached a terminal state yet.
    #[error("Task '{task_id}' is still {status}")]
    ResultNotReady { task_id: TaskId, status: TaskStatus },

    // ── Lifecycle errors ──────────────────────────────────────────────────
    /// An illegal state transition was attempted. Indicates an orchestrator
    /// bug, never a retryable condition.
    #[error("Illegal transition for task '{task_id}': {from} -> {to}")]
    Consistency {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The task was already forced to failure by the watchdog; late writes
    /// from the worker are discarded.
    #[error("Task '{task_id}' was abandoned after a timeout")]
    Abandoned { task_id: TaskId },

    /// A wait on behalf of the caller exceeded its bound.
    #[error("Task '{task_id}' exceeded {secs}s")]
    Timeout { task_id: TaskId, secs: u64 },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The pipeline builder failed. Shared by every waiter on the same key.
    #[error("Failed to build pipeline '{key}': {detail}")]
    PipelineBuild { key: String, detail: String },

    // ── Remote engine errors ──────────────────────────────────────────────
    /// The remote orchestrator rejected a request or was unreachable.
    #[error("Remote orchestrator error: {0}")]
    Remote(String),

    /// A callback arrived without a valid bearer credential.
    #[error("Unauthorized callback")]
    Unauthorized,

    /// A progress callback was well-formed but not applicable to the task.
    #[error("Invalid progress update: {0}")]
    InvalidProgress(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServeError {
    /// `true` when the error should be reported to the caller as its own
    /// fault (bad request) rather than a server-side condition.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServeError::Validation(_) | ServeError::InvalidProgress(_)
        )
    }
}

/// A non-fatal error for a single input document.
///
/// Stored alongside [`crate::output::DocumentResult`] when a document fails.
/// The task continues with the next document unless `abort_on_error` is set.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentError {
    /// The source could not be fetched or decoded.
    #[error("{source_name}: acquisition failed: {detail}")]
    Acquisition { source_name: String, detail: String },

    /// The document format is not accepted by the request or the pipeline.
    #[error("{filename}: unsupported format '{format}'")]
    UnsupportedFormat { filename: String, format: String },

    /// The conversion pipeline failed on this document.
    #[error("{filename}: conversion failed: {detail}")]
    ConversionFailed { filename: String, detail: String },
}

impl DocumentError {
    /// Name of the input this error belongs to.
    pub fn source_name(&self) -> &str {
        match self {
            DocumentError::Acquisition { source_name, .. } => source_name,
            DocumentError::UnsupportedFormat { filename, .. } => filename,
            DocumentError::ConversionFailed { filename, .. } => filename,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_display_names_both_states() {
        let e = ServeError::Consistency {
            task_id: TaskId::from("t-1"),
            from: TaskStatus::Success,
            to: TaskStatus::Started,
        };
        let msg = e.to_string();
        assert!(msg.contains("success -> started"), "got: {msg}");
        assert!(msg.contains("t-1"));
    }

    #[test]
    fn validation_is_client_error() {
        assert!(ServeError::Validation("x".into()).is_client_error());
        assert!(!ServeError::Internal("x".into()).is_client_error());
        assert!(!ServeError::Capacity { reason: "full".into() }.is_client_error());
    }

    #[test]
    fn document_error_serialises_with_kind_tag() {
        let e = DocumentError::ConversionFailed {
            filename: "a.md".into(),
            detail: "boom".into(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "conversion_failed");
        assert_eq!(v["filename"], "a.md");
        assert_eq!(e.source_name(), "a.md");
    }

    #[test]
    fn pipeline_build_display() {
        let e = ServeError::PipelineBuild {
            key: "abc".into(),
            detail: "model missing".into(),
        };
        assert!(e.to_string().contains("model missing"));
    }
}
