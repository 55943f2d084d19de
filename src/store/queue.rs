//! Durable queue store: the full-document read-modify-write home of all
//! live tasks.
//!
//! The store provides no cross-process locking of its own. Callers keep the
//! window between `load` and `save` short; bulk claims additionally
//! serialize through the session lock so only one process performs them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;

use crate::task::{QueueDoc, Task};

use super::{load_json_soft, safe_write_json};

#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the live task map. A missing or partially-written document is
    /// "no tasks yet", never an error.
    #[must_use]
    pub fn load(&self) -> BTreeMap<String, Task> {
        let doc: QueueDoc = load_json_soft(&self.path);
        doc.tasks
    }

    /// Full-document overwrite, lifting a read-only bit if one was set.
    pub fn save(&self, tasks: &BTreeMap<String, Task>) -> Result<()> {
        let doc = QueueDoc {
            tasks: tasks.clone(),
        };
        safe_write_json(&self.path, &doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    fn task(description: &str) -> Task {
        Task {
            status: TaskStatus::Queued,
            description: description.to_string(),
            priority: Priority::Medium,
            context: serde_json::Map::new(),
            batch_id: "batch_test".to_string(),
            created_at: Utc::now(),
            started_at: None,
            updated_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempdir().expect("tempdir");
        let store = QueueStore::new(tmp.path().join("queue.json"));
        let mut tasks = BTreeMap::new();
        tasks.insert("t1".to_string(), task("write tests"));
        store.save(&tasks).expect("save");

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["t1"].description, "write tests");
        assert_eq!(loaded["t1"].status, TaskStatus::Queued);
    }

    #[test]
    fn corrupt_document_reads_as_empty() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("queue.json");
        std::fs::write(&path, "{\"tasks\": {\"t1\": {").expect("write");
        let store = QueueStore::new(path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn missing_document_reads_as_empty() {
        let tmp = tempdir().expect("tempdir");
        let store = QueueStore::new(tmp.path().join("queue.json"));
        assert!(store.load().is_empty());
    }
}
