//! Batch intake: turn a JSON array of raw task items into queued tasks
//! under one shared batch id. Per-item failures are collected, never
//! cascaded, so one malformed item cannot sink the rest of the batch.

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::queue::{CreateTask, QueueManager};
use crate::task::Priority;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ItemOutcome {
    Created { task_id: String },
    Failed { task_id: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub details: Vec<ItemOutcome>,
}

/// Submit a batch of raw items. Each item must be an object with at least
/// `task_id` and `description`; `priority`, `context`, and `batch_id` are
/// optional. Items missing an explicit `batch_id` inherit the generated
/// batch-wide one.
pub fn batch_create(manager: &QueueManager, items: &[Value]) -> BatchOutcome {
    let batch_id = format!(
        "batch_{}_{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        &Uuid::new_v4().to_string()[..8]
    );

    let mut details = Vec::with_capacity(items.len());
    let mut success_count = 0;
    for (index, item) in items.iter().enumerate() {
        let task_id = item
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("item_{index}"));
        match build_request(item, &batch_id) {
            Ok(req) => match manager.create_task(req) {
                Ok(created) => {
                    success_count += 1;
                    details.push(ItemOutcome::Created {
                        task_id: created.task_id,
                    });
                }
                Err(err) => details.push(ItemOutcome::Failed {
                    task_id,
                    error: err.to_string(),
                }),
            },
            Err(error) => details.push(ItemOutcome::Failed { task_id, error }),
        }
    }

    BatchOutcome {
        batch_id,
        total: items.len(),
        failed_count: items.len() - success_count,
        success_count,
        details,
    }
}

fn build_request(item: &Value, batch_id: &str) -> Result<CreateTask, String> {
    let Some(object) = item.as_object() else {
        return Err("batch item must be a JSON object".to_string());
    };

    let task_id = object
        .get("task_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "missing required field: task_id".to_string())?;
    let description = object
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| "missing required field: description".to_string())?;

    let priority = match object.get("priority") {
        None | Some(Value::Null) => Priority::default(),
        Some(Value::String(text)) => Priority::parse(text)
            .ok_or_else(|| format!("invalid priority '{text}' (high, medium, low)"))?,
        Some(other) => return Err(format!("priority must be a string, got {other}")),
    };

    let context = match object.get("context") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => return Err(format!("context must be an object, got {other}")),
    };

    let item_batch = object
        .get("batch_id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(batch_id);

    Ok(CreateTask {
        task_id: task_id.to_string(),
        description: description.to_string(),
        priority,
        context,
        batch_id: Some(item_batch.to_string()),
        execution_hint: None,
    })
}
