//! Result store with retention-bounded size and an append-only archive.
//!
//! The live document keeps at most `cap` results. After every insert the
//! overflow (oldest by completion time) is appended to a monthly NDJSON log
//! under `archive/`; the live store is only pruned once that append has
//! succeeded, so an archive failure never loses results.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use crate::task::{ResultsDoc, TaskResult};

use super::{load_json_soft, safe_write_json};

#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
    archive_dir: PathBuf,
    cap: usize,
}

impl ResultStore {
    #[must_use]
    pub fn new(path: PathBuf, archive_dir: PathBuf, cap: usize) -> Self {
        Self {
            path,
            archive_dir,
            cap,
        }
    }

    #[must_use]
    pub fn load(&self) -> BTreeMap<String, TaskResult> {
        let doc: ResultsDoc = load_json_soft(&self.path);
        doc.results
    }

    pub fn save(&self, results: &BTreeMap<String, TaskResult>) -> Result<()> {
        let doc = ResultsDoc {
            results: results.clone(),
        };
        safe_write_json(&self.path, &doc)
    }

    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<TaskResult> {
        self.load().remove(task_id)
    }

    /// Results sorted newest-first, truncated to `limit`.
    #[must_use]
    pub fn list_recent(&self, limit: Option<usize>) -> Vec<(String, TaskResult)> {
        let mut entries: Vec<(String, TaskResult)> = self.load().into_iter().collect();
        entries.sort_by(|a, b| b.1.completed_at.cmp(&a.1.completed_at));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }

    /// How many results already carry this batch id. Drives batch-position
    /// numbering and first-in-batch token accounting.
    #[must_use]
    pub fn completed_in_batch(&self, batch_id: &str) -> usize {
        self.load()
            .values()
            .filter(|result| result.batch_id.as_deref() == Some(batch_id))
            .count()
    }

    /// Write one result, then archive any overflow past the retention cap.
    pub fn insert(&self, task_id: &str, result: TaskResult) -> Result<()> {
        let mut results = self.load();
        results.insert(task_id.to_string(), result);
        self.save(&results)?;

        if let Err(err) = self.archive_overflow(&mut results) {
            // Non-fatal: the live store just stays over cap until next time.
            tracing::warn!("Could not archive old results: {err}");
        }
        Ok(())
    }

    /// Amend an existing result in place (telemetry merge path).
    pub fn amend<F>(&self, task_id: &str, amend: F) -> Result<bool>
    where
        F: FnOnce(&mut TaskResult),
    {
        let mut results = self.load();
        let Some(result) = results.get_mut(task_id) else {
            return Ok(false);
        };
        amend(result);
        self.save(&results)?;
        Ok(true)
    }

    fn archive_overflow(&self, results: &mut BTreeMap<String, TaskResult>) -> Result<usize> {
        if results.len() <= self.cap {
            return Ok(0);
        }

        let mut ordered: Vec<(String, TaskResult)> =
            results.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        ordered.sort_by(|a, b| a.1.completed_at.cmp(&b.1.completed_at));
        let overflow = ordered.len() - self.cap;
        let to_archive = &ordered[..overflow];

        fs::create_dir_all(&self.archive_dir).with_context(|| {
            format!("Failed to create archive dir {}", self.archive_dir.display())
        })?;
        let archive_path = self
            .archive_dir
            .join(format!("results_{}.jsonl", Utc::now().format("%Y-%m")));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&archive_path)
            .with_context(|| format!("Failed to open {}", archive_path.display()))?;

        for (task_id, result) in to_archive {
            let mut line = serde_json::to_value(result)?;
            if let Value::Object(map) = &mut line {
                map.insert("task_id".to_string(), Value::String(task_id.clone()));
            }
            writeln!(file, "{line}")
                .with_context(|| format!("Failed to append {}", archive_path.display()))?;
        }
        file.flush()
            .with_context(|| format!("Failed to flush {}", archive_path.display()))?;

        // Prune only after the archive append succeeded.
        for (task_id, _) in to_archive {
            results.remove(task_id);
        }
        self.save(results)?;
        tracing::debug!(
            "Archived {overflow} result(s) to {}",
            archive_path.display()
        );
        Ok(overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn result(seq: i64) -> TaskResult {
        TaskResult {
            status: TaskStatus::Done,
            description: format!("task {seq}"),
            completed_at: Utc::now() + Duration::seconds(seq),
            execution_time_seconds: 1.0,
            actions_taken: vec!["did a thing".to_string()],
            output: Value::Null,
            output_summary: "ok".to_string(),
            errors: None,
            batch_id: Some("batch_a".to_string()),
            batch_position: None,
            tokens: None,
            token_cost: None,
            tool: None,
            action: None,
        }
    }

    fn store(root: &std::path::Path, cap: usize) -> ResultStore {
        ResultStore::new(root.join("results.json"), root.join("archive"), cap)
    }

    #[test]
    fn live_store_never_exceeds_cap() {
        let tmp = tempdir().expect("tempdir");
        let store = store(tmp.path(), 3);
        for seq in 0..7 {
            store
                .insert(&format!("t{seq}"), result(seq))
                .expect("insert");
        }
        let live = store.load();
        assert_eq!(live.len(), 3);
        // Newest three survive.
        assert!(live.contains_key("t4"));
        assert!(live.contains_key("t5"));
        assert!(live.contains_key("t6"));
    }

    #[test]
    fn overflow_lands_in_monthly_archive_oldest_first() {
        let tmp = tempdir().expect("tempdir");
        let store = store(tmp.path(), 2);
        for seq in 0..5 {
            store
                .insert(&format!("t{seq}"), result(seq))
                .expect("insert");
        }

        let archive_path = tmp
            .path()
            .join("archive")
            .join(format!("results_{}.jsonl", Utc::now().format("%Y-%m")));
        let content = fs::read_to_string(&archive_path).expect("archive exists");
        let ids: Vec<String> = content
            .lines()
            .map(|line| {
                let value: Value = serde_json::from_str(line).expect("valid line");
                value["task_id"].as_str().expect("task_id").to_string()
            })
            .collect();
        assert_eq!(ids, vec!["t0", "t1", "t2"]);

        // Archived entries never reappear in listings.
        let listed: Vec<String> = store
            .list_recent(None)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(listed, vec!["t4", "t3"]);
    }

    #[test]
    fn failed_archive_append_keeps_results_live() {
        let tmp = tempdir().expect("tempdir");
        // Occupy the archive path with a plain file so the append can never
        // go through.
        fs::write(tmp.path().join("archive"), "in the way").expect("block archive dir");
        let store = store(tmp.path(), 2);

        for seq in 0..5 {
            store
                .insert(&format!("t{seq}"), result(seq))
                .expect("insert succeeds despite archive failure");
        }

        // Nothing was pruned: every result is still live, over the cap.
        let live = store.load();
        assert_eq!(live.len(), 5);
        for seq in 0..5 {
            assert!(live.contains_key(&format!("t{seq}")));
        }
        assert!(tmp.path().join("archive").is_file());
    }

    #[test]
    fn list_recent_sorts_newest_first_and_limits() {
        let tmp = tempdir().expect("tempdir");
        let store = store(tmp.path(), 10);
        for seq in 0..4 {
            store
                .insert(&format!("t{seq}"), result(seq))
                .expect("insert");
        }
        let listed = store.list_recent(Some(2));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "t3");
        assert_eq!(listed[1].0, "t2");
    }

    #[test]
    fn amend_updates_existing_entry_only() {
        let tmp = tempdir().expect("tempdir");
        let store = store(tmp.path(), 10);
        store.insert("t0", result(0)).expect("insert");

        let amended = store
            .amend("t0", |result| result.token_cost = Some(42))
            .expect("amend");
        assert!(amended);
        assert_eq!(store.get("t0").expect("present").token_cost, Some(42));

        let missing = store
            .amend("ghost", |result| result.token_cost = Some(1))
            .expect("amend missing");
        assert!(!missing);
    }

    #[test]
    fn completed_in_batch_counts_matching_results() {
        let tmp = tempdir().expect("tempdir");
        let store = store(tmp.path(), 10);
        store.insert("t0", result(0)).expect("insert");
        let mut other = result(1);
        other.batch_id = Some("batch_b".to_string());
        store.insert("t1", other).expect("insert");

        assert_eq!(store.completed_in_batch("batch_a"), 1);
        assert_eq!(store.completed_in_batch("batch_b"), 1);
        assert_eq!(store.completed_in_batch("batch_c"), 0);
    }
}
