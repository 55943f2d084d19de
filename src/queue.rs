//! Queue manager: the task lifecycle state machine and the boundary
//! operations built on top of the stores.
//!
//! State machine: `queued -> in_progress -> {done, error}` and
//! `queued -> cancelled`. Update and cancel are only legal while a task is
//! still `queued`; the bulk claim moves every queued task to `in_progress`
//! at one shared instant; completion removes the task from the queue and
//! writes its result as a unit. No transition is retried automatically —
//! violations come back as structured errors and the caller re-issues.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{QueueError, QueueResult};
use crate::lock::{Acquisition, SessionLock, is_process_alive};
use crate::spawner::{AgentSpawner, SpawnOutcome};
use crate::store::queue::QueueStore;
use crate::store::results::ResultStore;
use crate::task::{Priority, Task, TaskResult, TaskStatus};
use crate::telemetry::TelemetryStore;

// === Requests ===

#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub task_id: String,
    pub description: String,
    pub priority: Priority,
    pub context: Map<String, Value>,
    pub batch_id: Option<String>,
    /// System-injected execution hint, merged into `context`.
    pub execution_hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTask {
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub context: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct CompleteRequest {
    pub status: TaskStatus,
    pub actions_taken: Vec<String>,
    pub output: Value,
    pub output_summary: Option<String>,
    pub errors: Option<String>,
    pub execution_time_seconds: Option<f64>,
}

// === Reports (serialized by the CLI) ===

#[derive(Debug, Clone, Serialize)]
pub struct CreatedTask {
    pub task_id: String,
    pub batch_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub task_id: String,
    pub updated_fields: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelReport {
    pub task_id: String,
    pub previous_status: TaskStatus,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub batch_id: String,
    pub batch_position: u32,
    pub execution_time_seconds: f64,
    pub telemetry_merged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub task_id: String,
    pub task_status: TaskStatus,
    /// Where the record lives: still `queue`, or already `results`.
    pub location: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    AlreadyRunning {
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    NoTasks,
    Started {
        task_count: usize,
        pid: u32,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: usize,
    pub in_progress: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub task_id: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub description: String,
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueListing {
    pub counts: QueueCounts,
    pub tasks: Vec<QueueEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequeueReport {
    pub requeued: Vec<String>,
}

// === Manager ===

pub struct QueueManager {
    queue: QueueStore,
    results: ResultStore,
    telemetry: TelemetryStore,
    lock: SessionLock,
}

impl QueueManager {
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|err| {
            anyhow::anyhow!("Failed to create data dir {}: {err}", config.data_dir.display())
        })?;
        Ok(Self {
            queue: QueueStore::new(config.queue_path()),
            results: ResultStore::new(
                config.results_path(),
                config.archive_dir(),
                config.retention_cap,
            ),
            telemetry: TelemetryStore::new(config.telemetry_path(), config.agent_log_path()),
            lock: SessionLock::new(config.lock_path()),
        })
    }

    /// Create a single task at `queued`. A bulk submission goes through
    /// [`crate::intake::batch_create`], which calls this per item.
    pub fn create_task(&self, req: CreateTask) -> QueueResult<CreatedTask> {
        if req.task_id.trim().is_empty() {
            return Err(QueueError::Validation(
                "missing required field: task_id".to_string(),
            ));
        }
        if req.description.trim().is_empty() {
            return Err(QueueError::Validation(
                "missing required field: description".to_string(),
            ));
        }

        let mut tasks = self.queue.load();
        if tasks.contains_key(&req.task_id) {
            return Err(QueueError::Validation(format!(
                "task '{}' already exists in the queue",
                req.task_id
            )));
        }

        let batch_id = req
            .batch_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| generate_batch_id(&req.task_id));

        let mut context = req.context;
        if let Some(hint) = req.execution_hint {
            context.insert("execution_hint".to_string(), Value::String(hint));
        }

        let task = Task {
            status: TaskStatus::Queued,
            description: req.description,
            priority: req.priority,
            context,
            batch_id: batch_id.clone(),
            created_at: Utc::now(),
            started_at: None,
            updated_at: None,
            cancelled_at: None,
        };
        tasks.insert(req.task_id.clone(), task);
        self.queue.save(&tasks)?;

        Ok(CreatedTask {
            task_id: req.task_id,
            batch_id,
            status: TaskStatus::Queued,
        })
    }

    /// Mutate a still-queued task. New context keys merge into the existing
    /// map rather than replacing it.
    pub fn update_task(&self, task_id: &str, changes: UpdateTask) -> QueueResult<UpdateReport> {
        if changes.description.is_none() && changes.priority.is_none() && changes.context.is_none()
        {
            return Err(QueueError::Validation(
                "must provide at least one field to update (description, priority, or context)"
                    .to_string(),
            ));
        }

        let mut tasks = self.queue.load();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Queued {
            return Err(QueueError::StateConflict {
                task_id: task_id.to_string(),
                expected: "queued",
                actual: task.status.as_str().to_string(),
            });
        }

        let mut updated_fields = Vec::new();
        if let Some(description) = changes.description {
            task.description = description;
            updated_fields.push("description");
        }
        if let Some(priority) = changes.priority {
            task.priority = priority;
            updated_fields.push("priority");
        }
        if let Some(context) = changes.context {
            for (key, value) in context {
                task.context.insert(key, value);
            }
            updated_fields.push("context");
        }
        task.updated_at = Some(Utc::now());
        self.queue.save(&tasks)?;

        Ok(UpdateReport {
            task_id: task_id.to_string(),
            updated_fields,
        })
    }

    /// Cancel a task that has not been claimed yet. Once claimed there is
    /// no cancellation channel to the detached agent.
    pub fn cancel_task(&self, task_id: &str) -> QueueResult<CancelReport> {
        let mut tasks = self.queue.load();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Queued {
            return Err(QueueError::StateConflict {
                task_id: task_id.to_string(),
                expected: "queued",
                actual: task.status.as_str().to_string(),
            });
        }

        let previous_status = task.status;
        let now = Utc::now();
        task.status = TaskStatus::Cancelled;
        task.cancelled_at = Some(now);
        self.queue.save(&tasks)?;

        Ok(CancelReport {
            task_id: task_id.to_string(),
            previous_status,
            cancelled_at: now,
        })
    }

    /// Bulk claim: every `queued` task becomes `in_progress` with the same
    /// `started_at` instant, so the session can be told "process exactly
    /// these". Only ever called under the session lock.
    pub fn claim_all(&self) -> QueueResult<Vec<(String, Task)>> {
        let mut tasks = self.queue.load();
        let now = Utc::now();
        let mut claimed = Vec::new();
        for (task_id, task) in &mut tasks {
            if task.status == TaskStatus::Queued {
                task.status = TaskStatus::InProgress;
                task.started_at = Some(now);
                claimed.push((task_id.clone(), task.clone()));
            }
        }
        if claimed.is_empty() {
            return Ok(claimed);
        }
        self.queue.save(&tasks)?;
        Ok(claimed)
    }

    /// Complete one task: remove it from the queue and write its result as
    /// a unit, then merge telemetry best-effort.
    pub fn complete_task(
        &self,
        task_id: &str,
        req: CompleteRequest,
    ) -> QueueResult<CompletionReport> {
        debug_assert!(matches!(req.status, TaskStatus::Done | TaskStatus::Error));

        let mut tasks = self.queue.load();
        let task = tasks
            .get(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::InProgress {
            return Err(QueueError::StateConflict {
                task_id: task_id.to_string(),
                expected: "in_progress",
                actual: task.status.as_str().to_string(),
            });
        }

        let task = tasks.remove(task_id).expect("presence checked above");
        self.queue.save(&tasks)?;

        let completed_at = Utc::now();
        let execution_time_seconds = req.execution_time_seconds.unwrap_or_else(|| {
            task.started_at
                .map(|started| {
                    let millis = (completed_at - started).num_milliseconds();
                    (millis.max(0) as f64) / 1000.0
                })
                .unwrap_or(0.0)
        });

        let batch_id = task.batch_id.clone();
        let prior_in_batch = self.results.completed_in_batch(&batch_id);
        let first_in_batch = prior_in_batch == 0;
        let batch_position = u32::try_from(prior_in_batch + 1).unwrap_or(u32::MAX);

        let output_summary = req.output_summary.unwrap_or_else(|| {
            if req.status == TaskStatus::Done {
                "Task completed".to_string()
            } else {
                "Task failed".to_string()
            }
        });

        let result = TaskResult {
            status: req.status,
            description: task.description,
            completed_at,
            execution_time_seconds,
            actions_taken: req.actions_taken,
            output: req.output,
            output_summary,
            errors: req.errors,
            batch_id: Some(batch_id.clone()),
            batch_position: Some(batch_position),
            tokens: None,
            token_cost: None,
            tool: None,
            action: None,
        };
        self.results.insert(task_id, result)?;

        // Usage reporting must never block completion.
        let mut telemetry_merged = false;
        if let Some(snapshot) = self.telemetry.collect() {
            match self.results.amend(task_id, |result| {
                telemetry_merged = TelemetryStore::apply(&snapshot, result, first_in_batch);
            }) {
                Ok(found) => {
                    if !found {
                        telemetry_merged = false;
                    }
                }
                Err(err) => {
                    telemetry_merged = false;
                    tracing::warn!("Could not merge telemetry for '{task_id}': {err}");
                }
            }
        }

        Ok(CompletionReport {
            task_id: task_id.to_string(),
            status: req.status,
            batch_id,
            batch_position,
            execution_time_seconds,
            telemetry_merged,
        })
    }

    /// Acquire the session lock, claim everything queued, hand it to the
    /// spawner, and release the lock once work is handed off. `AlreadyRunning`
    /// is a valid outcome, not an error.
    pub fn claim_and_dispatch(&self, spawner: &AgentSpawner) -> QueueResult<DispatchOutcome> {
        match self.lock.try_acquire()? {
            Acquisition::Busy { pid } => Ok(DispatchOutcome::AlreadyRunning { pid }),
            Acquisition::Acquired => {
                let outcome = self.dispatch_locked(spawner);
                // Release after handoff: the agent runs detached, so holding
                // the lock for its whole lifetime is neither possible nor
                // intended.
                self.lock.release();
                outcome
            }
        }
    }

    fn dispatch_locked(&self, spawner: &AgentSpawner) -> QueueResult<DispatchOutcome> {
        let claimed = self.claim_all()?;
        if claimed.is_empty() {
            return Ok(DispatchOutcome::NoTasks);
        }
        self.lock.update_task_count(claimed.len());

        // On spawn failure the claimed tasks stay in_progress with no owner;
        // an operator re-dispatches or requeues them.
        match spawner.spawn(&claimed)? {
            SpawnOutcome::NoTasks => Ok(DispatchOutcome::NoTasks),
            SpawnOutcome::Started { pid, task_count } => {
                Ok(DispatchOutcome::Started { task_count, pid })
            }
        }
    }

    /// Status lookup across both stores: the live queue first, then the
    /// completed results.
    pub fn get_status(&self, task_id: &str) -> QueueResult<StatusReport> {
        if let Some(task) = self.queue.load().get(task_id) {
            return Ok(StatusReport {
                task_id: task_id.to_string(),
                task_status: task.status,
                location: "queue",
                created_at: Some(task.created_at),
                completed_at: None,
                description: task.description.clone(),
            });
        }
        if let Some(result) = self.results.get(task_id) {
            return Ok(StatusReport {
                task_id: task_id.to_string(),
                task_status: result.status,
                location: "results",
                created_at: None,
                completed_at: Some(result.completed_at),
                description: result.description,
            });
        }
        Err(QueueError::NotFound(task_id.to_string()))
    }

    pub fn get_result(&self, task_id: &str) -> QueueResult<TaskResult> {
        self.results
            .get(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
    }

    #[must_use]
    pub fn list_results(&self, limit: Option<usize>) -> Vec<(String, TaskResult)> {
        self.results.list_recent(limit)
    }

    /// Record a usage snapshot on behalf of the agent.
    pub fn record_telemetry(&self, snapshot: &crate::telemetry::TelemetrySnapshot) -> QueueResult<()> {
        self.telemetry.record(snapshot)?;
        Ok(())
    }

    #[must_use]
    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for task in self.queue.load().values() {
            match task.status {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
                TaskStatus::Done | TaskStatus::Error => {}
            }
        }
        counts
    }

    /// Live queue entries, oldest first, with status totals.
    #[must_use]
    pub fn list_queue(&self) -> QueueListing {
        let tasks = self.queue.load();
        let mut entries: Vec<QueueEntry> = tasks
            .into_iter()
            .map(|(task_id, task)| QueueEntry {
                task_id,
                status: task.status,
                priority: task.priority,
                description: task.description,
                batch_id: task.batch_id,
                created_at: task.created_at,
            })
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        QueueListing {
            counts: self.counts(),
            tasks: entries,
        }
    }

    /// Move stale `in_progress` tasks back to `queued`. There is no
    /// automatic timeout on claims; this is the operator's recovery path
    /// when an agent died without reporting. Refused while a live process
    /// holds the session lock: requeueing mid-dispatch would hand the same
    /// tasks to two sessions.
    pub fn requeue_stale(&self, older_than_secs: u64, all: bool) -> QueueResult<RequeueReport> {
        if let Some(holder) = self.lock.read()
            && is_process_alive(holder.pid)
        {
            return Err(QueueError::AlreadyRunning {
                pid: Some(holder.pid),
            });
        }

        let cutoff = Utc::now() - Duration::seconds(i64::try_from(older_than_secs).unwrap_or(i64::MAX));
        let mut tasks = self.queue.load();
        let mut requeued = Vec::new();
        for (task_id, task) in &mut tasks {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let stale = all || task.started_at.is_none_or(|started| started < cutoff);
            if stale {
                task.status = TaskStatus::Queued;
                task.started_at = None;
                requeued.push(task_id.clone());
            }
        }
        if !requeued.is_empty() {
            self.queue.save(&tasks)?;
            tracing::info!("Requeued {} stale task(s)", requeued.len());
        }
        Ok(RequeueReport { requeued })
    }
}

fn generate_batch_id(task_id: &str) -> String {
    let mut prefix: String = task_id.chars().take(8).collect();
    if prefix.is_empty() {
        prefix = Uuid::new_v4().to_string()[..8].to_string();
    }
    format!("batch_{}_{prefix}", Utc::now().format("%Y%m%d_%H%M%S"))
}
