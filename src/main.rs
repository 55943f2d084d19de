//! CLI entry point for `dispatchq`.

use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use dotenvy::dotenv;
use serde::Serialize;
use serde_json::Value;

mod config;
mod error;
mod intake;
mod lock;
mod logging;
mod queue;
mod spawner;
mod store;
mod task;
mod telemetry;
mod watcher;

use crate::config::Config;
use crate::error::{QueueError, QueueResult};
use crate::queue::{CompleteRequest, CreateTask, QueueManager, UpdateTask};
use crate::spawner::AgentSpawner;
use crate::task::{Priority, TaskStatus};
use crate::telemetry::TelemetrySnapshot;
use crate::watcher::Watcher;

#[derive(Parser, Debug)]
#[command(
    name = "dispatchq",
    author,
    version,
    about = "Durable task queue with single-flight agent dispatch",
    long_about = "File-backed task queue for background agent sessions.\n\n\
        Tasks are queued as JSON on disk, claimed in bulk, and handed to a\n\
        detached agent process. At most one agent session runs per data dir."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (default: DISPATCHQ_DATA_DIR or ~/.dispatchq)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Queue a single task
    Add {
        /// Unique task identifier
        task_id: String,
        /// What the task should accomplish
        description: String,
        /// Task priority (high, medium, low)
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Extra context as a JSON object
        #[arg(long)]
        context: Option<String>,
        /// Group this task under an existing batch
        #[arg(long)]
        batch_id: Option<String>,
        /// Execution hint injected into the task context
        #[arg(long)]
        hint: Option<String>,
    },
    /// Queue a batch of tasks from a JSON array (file or stdin)
    Batch {
        /// Path to a JSON file; reads stdin when omitted
        file: Option<PathBuf>,
    },
    /// Edit a task that has not been claimed yet
    Update {
        task_id: String,
        /// New description
        #[arg(long)]
        description: Option<String>,
        /// New priority (high, medium, low)
        #[arg(long)]
        priority: Option<String>,
        /// Context keys to merge in, as a JSON object
        #[arg(long)]
        context: Option<String>,
    },
    /// Cancel a task that has not been claimed yet
    Cancel { task_id: String },
    /// Claim all queued tasks and launch a detached agent session
    Dispatch,
    /// Poll the queue and dispatch whenever work appears
    Watch {
        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Record a task's outcome (called by the agent)
    Complete {
        task_id: String,
        /// Terminal status (done, error)
        #[arg(long)]
        status: String,
        /// Action taken (repeatable)
        #[arg(long = "action")]
        actions: Vec<String>,
        /// Structured output as JSON
        #[arg(long)]
        output: Option<String>,
        /// One-line summary of the outcome
        #[arg(long)]
        summary: Option<String>,
        /// Error detail for failed tasks
        #[arg(long)]
        errors: Option<String>,
        /// Wall-clock seconds, overrides the derived value
        #[arg(long)]
        execution_time: Option<f64>,
    },
    /// Record token usage for the next completion (called by the agent)
    Telemetry {
        task_id: String,
        /// Input tokens consumed
        #[arg(long)]
        input: u64,
        /// Output tokens produced
        #[arg(long)]
        output: u64,
        /// Tool that produced the usage
        #[arg(long)]
        tool: Option<String>,
        /// Action label for the usage
        #[arg(long)]
        action: Option<String>,
    },
    /// Look up a task across the queue and results
    Status { task_id: String },
    /// Fetch one completed result
    Result { task_id: String },
    /// List recent results, newest first
    Results {
        /// Maximum results to display
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show the live queue and status totals
    Queue,
    /// Return stale in_progress tasks to queued
    Requeue {
        /// Staleness threshold in seconds
        #[arg(long)]
        older_than: Option<u64>,
        /// Requeue every in_progress task regardless of age
        #[arg(long)]
        all: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::set_verbose(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        generate_completions(*shell);
        return Ok(());
    }

    let config = Config::with_data_dir(cli.data_dir.clone());
    let manager = QueueManager::open(&config)?;

    match cli.command {
        Commands::Add {
            task_id,
            description,
            priority,
            context,
            batch_id,
            hint,
        } => report(run_add(
            &manager, task_id, description, &priority, context, batch_id, hint,
        )),
        Commands::Batch { file } => {
            let items = read_batch_items(file.as_deref())?;
            print_json(&intake::batch_create(&manager, &items))
        }
        Commands::Update {
            task_id,
            description,
            priority,
            context,
        } => report(run_update(&manager, &task_id, description, priority, context)),
        Commands::Cancel { task_id } => report(manager.cancel_task(&task_id)),
        Commands::Dispatch => {
            let spawner = AgentSpawner::new(&config);
            report(manager.claim_and_dispatch(&spawner))
        }
        Commands::Watch { interval } => {
            let spawner = AgentSpawner::new(&config);
            let interval = interval.unwrap_or(config.poll_interval_secs);
            Watcher::new(&manager, &spawner, interval).run().await
        }
        Commands::Complete {
            task_id,
            status,
            actions,
            output,
            summary,
            errors,
            execution_time,
        } => report(run_complete(
            &manager,
            &task_id,
            &status,
            actions,
            output,
            summary,
            errors,
            execution_time,
        )),
        Commands::Telemetry {
            task_id,
            input,
            output,
            tool,
            action,
        } => {
            let snapshot = TelemetrySnapshot {
                tokens_input: input,
                tokens_output: output,
                tool,
                action,
                task_id: Some(task_id),
                execution_time_seconds: None,
                timestamp: Utc::now(),
            };
            report(manager.record_telemetry(&snapshot).map(|()| snapshot))
        }
        Commands::Status { task_id } => report(manager.get_status(&task_id)),
        Commands::Result { task_id } => report(manager.get_result(&task_id)),
        Commands::Results { limit } => {
            let results: Vec<Value> = manager
                .list_results(limit)
                .into_iter()
                .map(|(task_id, result)| {
                    let mut value = serde_json::to_value(result).unwrap_or(Value::Null);
                    if let Some(object) = value.as_object_mut() {
                        object.insert("task_id".to_string(), Value::String(task_id));
                    }
                    value
                })
                .collect();
            print_json(&results)
        }
        Commands::Queue => print_json(&manager.list_queue()),
        Commands::Requeue { older_than, all } => report(
            manager.requeue_stale(older_than.unwrap_or(config.stale_after_secs), all),
        ),
        Commands::Completions { .. } => unreachable!("handled before manager setup"),
    }
}

fn run_add(
    manager: &QueueManager,
    task_id: String,
    description: String,
    priority: &str,
    context: Option<String>,
    batch_id: Option<String>,
    hint: Option<String>,
) -> QueueResult<queue::CreatedTask> {
    manager.create_task(CreateTask {
        task_id,
        description,
        priority: parse_priority(priority)?,
        context: parse_context(context.as_deref())?.unwrap_or_default(),
        batch_id,
        execution_hint: hint,
    })
}

fn run_update(
    manager: &QueueManager,
    task_id: &str,
    description: Option<String>,
    priority: Option<String>,
    context: Option<String>,
) -> QueueResult<queue::UpdateReport> {
    let priority = priority.as_deref().map(parse_priority).transpose()?;
    manager.update_task(
        task_id,
        UpdateTask {
            description,
            priority,
            context: parse_context(context.as_deref())?,
        },
    )
}

#[allow(clippy::too_many_arguments)]
fn run_complete(
    manager: &QueueManager,
    task_id: &str,
    status: &str,
    actions: Vec<String>,
    output: Option<String>,
    summary: Option<String>,
    errors: Option<String>,
    execution_time: Option<f64>,
) -> QueueResult<queue::CompletionReport> {
    let status = TaskStatus::parse_terminal(status).ok_or_else(|| {
        QueueError::Validation(format!(
            "invalid completion status '{status}' (done, error)"
        ))
    })?;
    let output = match output {
        Some(text) => serde_json::from_str(&text)
            .map_err(|err| QueueError::Validation(format!("--output is not valid JSON: {err}")))?,
        None => Value::Null,
    };
    manager.complete_task(
        task_id,
        CompleteRequest {
            status,
            actions_taken: actions,
            output,
            output_summary: summary,
            errors,
            execution_time_seconds: execution_time,
        },
    )
}

fn parse_priority(value: &str) -> QueueResult<Priority> {
    Priority::parse(value).ok_or_else(|| {
        QueueError::Validation(format!("invalid priority '{value}' (high, medium, low)"))
    })
}

fn parse_context(value: Option<&str>) -> QueueResult<Option<serde_json::Map<String, Value>>> {
    value
        .map(|text| {
            serde_json::from_str(text)
                .map_err(|err| QueueError::Validation(format!("--context is not a JSON object: {err}")))
        })
        .transpose()
}

fn read_batch_items(file: Option<&std::path::Path>) -> Result<Vec<Value>> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read batch file {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read batch items from stdin")?;
            buffer
        }
    };
    serde_json::from_str(&text).context("Batch input must be a JSON array of task objects")
}

/// Print an operation's outcome as JSON: the report on success, a
/// structured error on failure. Errors exit nonzero so scripts can branch.
fn report<T: Serialize>(outcome: QueueResult<T>) -> Result<()> {
    match outcome {
        Ok(value) => print_json(&value),
        Err(err) => {
            let payload = serde_json::json!({
                "error": err.kind(),
                "message": err.to_string(),
            });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_else(|_| err.to_string())
            );
            std::process::exit(1);
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Generate shell completions for the given shell
fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
