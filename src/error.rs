//! Error taxonomy for queue operations.
//!
//! Guard violations and lookups return structured variants so callers can
//! distinguish "re-issue with different input" from "the store is broken".
//! Infrastructure failures are wrapped `anyhow` errors with context attached
//! at the point of failure.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Unknown task id in both the live queue and the result store.
    #[error("task '{0}' not found")]
    NotFound(String),

    /// A lifecycle guard rejected the transition.
    #[error("task '{task_id}' is {actual}, operation requires {expected}")]
    StateConflict {
        task_id: String,
        expected: &'static str,
        actual: String,
    },

    /// Malformed input at the request boundary.
    #[error("{0}")]
    Validation(String),

    /// An execution session is already active. Valid outcome for dispatch
    /// callers (back off and retry later), error for everything else.
    #[error("execution session already running{}", fmt_pid(.pid))]
    AlreadyRunning { pid: Option<u32> },

    /// The agent process could not be launched.
    #[error("failed to launch agent: {0}")]
    Spawn(String),

    /// The backing store could not be written (reads fail soft instead).
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

fn fmt_pid(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

impl QueueError {
    /// Stable machine-readable kind, used by the CLI's JSON error output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::StateConflict { .. } => "state_conflict",
            Self::Validation(_) => "validation_error",
            Self::AlreadyRunning { .. } => "already_running",
            Self::Spawn(_) => "spawn_error",
            Self::Persistence(_) => "persistence_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_conflict_names_both_states() {
        let err = QueueError::StateConflict {
            task_id: "t1".to_string(),
            expected: "queued",
            actual: "in_progress".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("queued"));
        assert!(message.contains("in_progress"));
        assert_eq!(err.kind(), "state_conflict");
    }

    #[test]
    fn already_running_formats_with_and_without_pid() {
        assert!(
            QueueError::AlreadyRunning { pid: Some(42) }
                .to_string()
                .contains("pid 42")
        );
        assert!(
            !QueueError::AlreadyRunning { pid: None }
                .to_string()
                .contains("pid")
        );
    }
}
