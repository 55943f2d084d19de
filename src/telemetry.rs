//! Telemetry snapshot store and reconciler.
//!
//! The agent writes one snapshot of token usage around each completion; the
//! next completion consumes it (merge then delete). With several tasks in
//! one batch the agent loads the shared context once, so only the first
//! completion in a batch is credited the input tokens; the rest get zero
//! input and keep their own output tokens.
//!
//! Everything here is best effort. A missing snapshot triggers one fallback
//! scan of the agent log for a usage marker; if that fails too, the result
//! simply carries no token fields.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::safe_write_json;
use crate::task::{TaskResult, TokenUsage};

/// Usage marker the instruction payload asks the agent to print, e.g.
/// `TOKENS input=1200 output=340`.
const USAGE_MARKER: &str = r"TOKENS\s+input=(\d+)\s+output=(\d+)";

/// Single-occupancy usage record written by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub tokens_input: u64,
    pub tokens_output: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_seconds: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TelemetryStore {
    path: PathBuf,
    agent_log: PathBuf,
}

impl TelemetryStore {
    #[must_use]
    pub fn new(path: PathBuf, agent_log: PathBuf) -> Self {
        Self { path, agent_log }
    }

    /// Write (replace) the snapshot. Called by the agent before completion.
    pub fn record(&self, snapshot: &TelemetrySnapshot) -> Result<()> {
        safe_write_json(&self.path, snapshot)
    }

    /// Consume the snapshot: read it and delete the file. Unparseable
    /// snapshots are dropped (and deleted) rather than blocking completion.
    pub fn take(&self) -> Option<TelemetrySnapshot> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!("Could not read telemetry snapshot: {err}");
                return None;
            }
        };
        let snapshot = serde_json::from_str::<TelemetrySnapshot>(&content)
            .map_err(|err| tracing::warn!("Could not parse telemetry snapshot: {err}"))
            .ok();
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!("Could not remove telemetry snapshot: {err}");
        }
        snapshot
    }

    /// Snapshot if present, otherwise one attempt to synthesize it from the
    /// agent log's usage marker.
    pub fn collect(&self) -> Option<TelemetrySnapshot> {
        if let Some(snapshot) = self.take() {
            return Some(snapshot);
        }
        tracing::debug!("No telemetry snapshot found, scanning agent log");
        match self.scan_agent_log() {
            Ok(Some(snapshot)) => Some(snapshot),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("Telemetry log scan failed: {err}");
                None
            }
        }
    }

    /// Merge a snapshot into a result. Only ever adds the token fields;
    /// status, output and timestamps stay untouched. Returns `false` when
    /// the snapshot carried no token data.
    pub fn apply(
        snapshot: &TelemetrySnapshot,
        result: &mut TaskResult,
        first_in_batch: bool,
    ) -> bool {
        if snapshot.tokens_input == 0 && snapshot.tokens_output == 0 {
            return false;
        }
        // Subsequent tasks in a batch share the already-loaded context.
        let input = if first_in_batch {
            snapshot.tokens_input
        } else {
            0
        };
        let output = snapshot.tokens_output;
        result.tokens = Some(TokenUsage {
            input,
            output,
            total: input + output,
        });
        result.token_cost = Some(input + output);
        if let Some(tool) = &snapshot.tool {
            result.tool = Some(tool.clone());
        }
        if let Some(action) = &snapshot.action {
            result.action = Some(action.clone());
        }
        true
    }

    fn scan_agent_log(&self) -> Result<Option<TelemetrySnapshot>> {
        let content = match fs::read_to_string(&self.agent_log) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to read agent log {}", self.agent_log.display())
                });
            }
        };
        let marker = Regex::new(USAGE_MARKER).expect("usage marker regex is valid");
        let Some(captures) = marker.captures_iter(&content).last() else {
            return Ok(None);
        };
        let tokens_input: u64 = captures[1].parse().unwrap_or(0);
        let tokens_output: u64 = captures[2].parse().unwrap_or(0);
        Ok(Some(TelemetrySnapshot {
            tokens_input,
            tokens_output,
            tool: Some("log_scan".to_string()),
            action: None,
            task_id: None,
            execution_time_seconds: None,
            timestamp: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use serde_json::Value;
    use tempfile::tempdir;

    fn snapshot(input: u64, output: u64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            tokens_input: input,
            tokens_output: output,
            tool: Some("shell".to_string()),
            action: None,
            task_id: Some("t1".to_string()),
            execution_time_seconds: None,
            timestamp: Utc::now(),
        }
    }

    fn result() -> TaskResult {
        TaskResult {
            status: TaskStatus::Done,
            description: "d".to_string(),
            completed_at: Utc::now(),
            execution_time_seconds: 1.0,
            actions_taken: Vec::new(),
            output: Value::Null,
            output_summary: "ok".to_string(),
            errors: None,
            batch_id: None,
            batch_position: None,
            tokens: None,
            token_cost: None,
            tool: None,
            action: None,
        }
    }

    fn store(root: &std::path::Path) -> TelemetryStore {
        TelemetryStore::new(root.join("telemetry.json"), root.join("agent.log"))
    }

    #[test]
    fn snapshot_is_single_use() {
        let tmp = tempdir().expect("tempdir");
        let store = store(tmp.path());
        store.record(&snapshot(100, 20)).expect("record");

        let taken = store.take().expect("present");
        assert_eq!(taken.tokens_input, 100);
        assert!(store.take().is_none());
        assert!(!tmp.path().join("telemetry.json").exists());
    }

    #[test]
    fn first_in_batch_gets_input_tokens_rest_get_zero() {
        let snap = snapshot(1200, 340);

        let mut first = result();
        assert!(TelemetryStore::apply(&snap, &mut first, true));
        let tokens = first.tokens.expect("tokens");
        assert_eq!(tokens.input, 1200);
        assert_eq!(tokens.output, 340);
        assert_eq!(first.token_cost, Some(1540));

        let mut later = result();
        assert!(TelemetryStore::apply(&snap, &mut later, false));
        let tokens = later.tokens.expect("tokens");
        assert_eq!(tokens.input, 0);
        assert_eq!(tokens.output, 340);
        assert_eq!(later.token_cost, Some(340));
    }

    #[test]
    fn apply_never_touches_status_or_output() {
        let snap = snapshot(10, 10);
        let mut res = result();
        let status_before = res.status;
        let completed_before = res.completed_at;
        TelemetryStore::apply(&snap, &mut res, true);
        assert_eq!(res.status, status_before);
        assert_eq!(res.completed_at, completed_before);
        assert_eq!(res.output, Value::Null);
    }

    #[test]
    fn empty_snapshot_is_not_applied() {
        let snap = snapshot(0, 0);
        let mut res = result();
        assert!(!TelemetryStore::apply(&snap, &mut res, true));
        assert!(res.tokens.is_none());
    }

    #[test]
    fn collect_falls_back_to_log_marker() {
        let tmp = tempdir().expect("tempdir");
        let store = store(tmp.path());
        std::fs::write(
            tmp.path().join("agent.log"),
            "starting up\nTOKENS input=50 output=10\nmore work\nTOKENS input=900 output=120\n",
        )
        .expect("write log");

        let snap = store.collect().expect("synthesized");
        // Last marker wins.
        assert_eq!(snap.tokens_input, 900);
        assert_eq!(snap.tokens_output, 120);
        assert_eq!(snap.tool.as_deref(), Some("log_scan"));
    }

    #[test]
    fn collect_without_snapshot_or_marker_is_none() {
        let tmp = tempdir().expect("tempdir");
        let store = store(tmp.path());
        std::fs::write(tmp.path().join("agent.log"), "no usage here").expect("write");
        assert!(store.collect().is_none());
    }
}
