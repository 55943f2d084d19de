//! Task and result records persisted by the queue.
//!
//! Tasks are keyed by caller-supplied id in the queue document; a task's id
//! never appears inside the record itself. Once completed the task record is
//! deleted and a `TaskResult` is written under the same key in the result
//! store, so an id can be re-used for a new task but never to touch an
//! in-flight one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle states. `done`/`error` only ever appear on results; the task
/// record leaves the queue at the moment of completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Done,
    Error,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a completion status reported by the agent.
    pub fn parse_terminal(value: &str) -> Option<Self> {
        match value {
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Advisory only; display ordering, no scheduling effect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// A unit of requested work, live in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub status: TaskStatus,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Opaque payload passed through to the agent. The queue only ever
    /// injects system keys (e.g. `execution_hint`), never reads it.
    #[serde(default)]
    pub context: Map<String, Value>,
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Token usage merged from a telemetry snapshot, after batch adjustment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

/// Durable record of a finished task. Append-only once written; the
/// telemetry reconciler may later add the token fields, nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub description: String,
    pub completed_at: DateTime<Utc>,
    pub execution_time_seconds: f64,
    pub actions_taken: Vec<String>,
    #[serde(default)]
    pub output: Value,
    pub output_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// 1-based ordinal within the batch's observed completion order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_cost: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// On-disk shape of `queue.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueueDoc {
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
}

/// On-disk shape of `results.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResultsDoc {
    #[serde(default)]
    pub results: BTreeMap<String, TaskResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, TaskStatus::Cancelled);
    }

    #[test]
    fn parse_terminal_rejects_live_states() {
        assert_eq!(TaskStatus::parse_terminal("done"), Some(TaskStatus::Done));
        assert_eq!(TaskStatus::parse_terminal("error"), Some(TaskStatus::Error));
        assert_eq!(TaskStatus::parse_terminal("queued"), None);
        assert_eq!(TaskStatus::parse_terminal("cancelled"), None);
    }

    #[test]
    fn queue_doc_tolerates_missing_fields() {
        let doc: QueueDoc = serde_json::from_str(
            r#"{"tasks":{"t1":{"status":"queued","description":"d","batch_id":"b","created_at":"2026-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();
        let task = &doc.tasks["t1"];
        assert_eq!(task.priority, Priority::Medium);
        assert!(task.context.is_empty());
        assert!(task.started_at.is_none());
    }
}
