//! Runtime configuration and data-directory layout.
//!
//! Everything the queue persists lives under one data directory:
//!
//! ```text
//! <data_dir>/queue.json        live tasks
//! <data_dir>/results.json      completed-task results (retention-capped)
//! <data_dir>/telemetry.json    single-occupancy usage snapshot
//! <data_dir>/session.lock      single-flight dispatch sentinel
//! <data_dir>/agent.log         captured agent stdout/stderr
//! <data_dir>/archive/          monthly NDJSON overflow of old results
//! ```

use std::path::PathBuf;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "DISPATCHQ_DATA_DIR";
/// Environment variable overriding the agent command.
pub const AGENT_CMD_ENV: &str = "DISPATCHQ_AGENT_CMD";
/// Comma-separated list of environment keys stripped from the agent's
/// environment at spawn (pay-per-token credentials).
pub const STRIP_ENV_ENV: &str = "DISPATCHQ_STRIP_ENV";

const DEFAULT_RETENTION_CAP: usize = 10;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_STALE_AFTER_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Executable launched by the dispatcher.
    pub agent_command: String,
    /// Arguments placed before the generated instruction payload.
    pub agent_args: Vec<String>,
    /// Environment keys removed from the spawned agent's environment so it
    /// authenticates with a flat-rate credential instead of a metered one.
    pub strip_env: Vec<String>,
    /// Maximum live entries in the result store before archival kicks in.
    pub retention_cap: usize,
    /// Poll cadence for the background watcher.
    pub poll_interval_secs: u64,
    /// Age after which an unfinished claim counts as stale for `requeue`.
    pub stale_after_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            agent_command: std::env::var(AGENT_CMD_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "agent".to_string()),
            agent_args: vec!["-p".to_string()],
            strip_env: strip_env_from_environment(),
            retention_cap: DEFAULT_RETENTION_CAP,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
        }
    }
}

impl Config {
    /// Default config with an explicit data directory (CLI `--data-dir`).
    pub fn with_data_dir(data_dir: Option<PathBuf>) -> Self {
        match data_dir {
            Some(data_dir) => Self {
                data_dir,
                ..Self::default()
            },
            None => Self::default(),
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue.json")
    }

    pub fn results_path(&self) -> PathBuf {
        self.data_dir.join("results.json")
    }

    pub fn telemetry_path(&self) -> PathBuf {
        self.data_dir.join("telemetry.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("session.lock")
    }

    pub fn agent_log_path(&self) -> PathBuf {
        self.data_dir.join("agent.log")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archive")
    }
}

/// Default data location (`~/.dispatchq`).
#[must_use]
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(DATA_DIR_ENV)
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".dispatchq");
    }
    PathBuf::from(".dispatchq")
}

fn strip_env_from_environment() -> Vec<String> {
    match std::env::var(STRIP_ENV_ENV) {
        Ok(value) => value
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => vec!["AGENT_API_KEY".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/dq"),
            ..Config::default()
        };
        assert_eq!(config.queue_path(), PathBuf::from("/tmp/dq/queue.json"));
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/dq/session.lock"));
        assert_eq!(config.archive_dir(), PathBuf::from("/tmp/dq/archive"));
    }
}
