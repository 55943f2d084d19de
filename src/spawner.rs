//! Detached agent process launcher.
//!
//! One spawned session processes every claimed task. The child is placed in
//! its own process group so it survives the dispatcher's exit; stdout and
//! stderr are captured to `agent.log` for diagnostics and for the telemetry
//! fallback scan. The caller never waits on the child: staleness is only
//! detected later through the session lock's pid probe.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::Context;
use serde::Serialize;

use crate::config::Config;
use crate::error::{QueueError, QueueResult};
use crate::task::Task;

/// Marker present in the environment of a running agent session. Its
/// presence means "we are already inside the agent" and spawning again
/// would recurse.
pub const SESSION_ENV: &str = "DISPATCHQ_AGENT_SESSION";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SpawnOutcome {
    NoTasks,
    Started { pid: u32, task_count: usize },
}

#[derive(Debug, Clone)]
pub struct AgentSpawner {
    command: String,
    args: Vec<String>,
    strip_env: Vec<String>,
    log_path: PathBuf,
    inside_session: bool,
}

impl AgentSpawner {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            command: config.agent_command.clone(),
            args: config.agent_args.clone(),
            strip_env: config.strip_env.clone(),
            log_path: config.agent_log_path(),
            inside_session: std::env::var_os(SESSION_ENV).is_some(),
        }
    }

    /// Hand the claimed tasks to a detached agent process and return
    /// immediately. Zero tasks is a no-op, not an error.
    pub fn spawn(&self, claimed: &[(String, Task)]) -> QueueResult<SpawnOutcome> {
        if claimed.is_empty() {
            return Ok(SpawnOutcome::NoTasks);
        }
        if self.inside_session {
            // Recursion, not contention: a nested session is a configuration
            // error and no amount of retrying will clear it.
            return Err(QueueError::Spawn(
                format!("nested agent session detected ({SESSION_ENV} set)"),
            ));
        }

        let instructions = build_instructions(claimed);

        let log_file = File::create(&self.log_path)
            .with_context(|| format!("Failed to create {}", self.log_path.display()))
            .map_err(|err| QueueError::Spawn(err.to_string()))?;
        let log_err = log_file
            .try_clone()
            .with_context(|| format!("Failed to clone handle for {}", self.log_path.display()))
            .map_err(|err| QueueError::Spawn(err.to_string()))?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(&instructions)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err));

        // The child must bill against the flat-rate credential and must not
        // think it is nested inside another session.
        for key in &self.strip_env {
            cmd.env_remove(key);
        }
        cmd.env_remove(SESSION_ENV);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group: the agent outlives this process.
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .map_err(|err| QueueError::Spawn(format!("{}: {err}", self.command)))?;

        let pid = child.id();
        tracing::info!("Agent session started (pid {pid}, {} task(s))", claimed.len());
        Ok(SpawnOutcome::Started {
            pid,
            task_count: claimed.len(),
        })
    }
}

/// One instruction payload covering every claimed task. The contract the
/// agent must follow: report each completion individually, and write the
/// telemetry snapshot (or print the usage marker) before completing.
fn build_instructions(claimed: &[(String, Task)]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Process the following {} task(s). For each task, in order of your choosing:\n\
         1. Do the work described.\n\
         2. Record usage before completing: `dispatchq telemetry <task_id> --input <n> --output <n>`\n\
            (or print a line `TOKENS input=<n> output=<n>`).\n\
         3. Report completion: `dispatchq complete <task_id> --status done --action \"...\"`\n\
            (use `--status error --errors \"...\"` on failure).\n\
         Every task must be completed individually; unreported work is lost.\n\n",
        claimed.len()
    ));
    for (task_id, task) in claimed {
        out.push_str(&format!("## Task {task_id}\n{}\n", task.description));
        if !task.context.is_empty() {
            let context = serde_json::to_string_pretty(&task.context)
                .unwrap_or_else(|_| "{}".to_string());
            out.push_str(&format!("Context:\n{context}\n"));
        }
        out.push('\n');
    }
    out
}
