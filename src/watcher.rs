//! Background watcher: polls the queue on an interval and dispatches a
//! session whenever queued work appears. One watcher per data dir is the
//! intended deployment; the session lock keeps accidental seconds honest.

use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::time::{self, MissedTickBehavior};

use crate::queue::{DispatchOutcome, QueueManager};
use crate::spawner::AgentSpawner;

pub struct Watcher<'a> {
    manager: &'a QueueManager,
    spawner: &'a AgentSpawner,
    interval: Duration,
}

impl<'a> Watcher<'a> {
    pub fn new(manager: &'a QueueManager, spawner: &'a AgentSpawner, interval_secs: u64) -> Self {
        Self {
            manager,
            spawner,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// Poll until interrupted. Each tick is independent; a failed dispatch
    /// is logged and the next tick tries again.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            "Watching queue every {}s (ctrl-c to stop)",
            self.interval.as_secs()
        );
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick() {
                        tracing::error!("Dispatch attempt failed: {err}");
                    }
                }
                _ = signal::ctrl_c() => {
                    tracing::info!("Interrupted, stopping watcher");
                    return Ok(());
                }
            }
        }
    }

    fn tick(&self) -> Result<()> {
        // Cheap pre-check so idle ticks never touch the lock.
        if self.manager.counts().queued == 0 {
            return Ok(());
        }
        match self.manager.claim_and_dispatch(self.spawner)? {
            DispatchOutcome::Started { task_count, pid } => {
                tracing::info!("Dispatched {task_count} task(s) to agent pid {pid}");
            }
            DispatchOutcome::AlreadyRunning { pid } => {
                tracing::debug!(
                    "Session already running (pid {}), will retry",
                    pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
                );
            }
            DispatchOutcome::NoTasks => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::CreateTask;
    use tempfile::tempdir;

    fn setup(root: &std::path::Path) -> (Config, QueueManager) {
        let config = Config {
            agent_command: "true".to_string(),
            agent_args: Vec::new(),
            ..Config::with_data_dir(Some(root.to_path_buf()))
        };
        let manager = QueueManager::open(&config).expect("open manager");
        (config, manager)
    }

    #[test]
    fn idle_tick_does_not_touch_the_lock() {
        let tmp = tempdir().expect("tempdir");
        let (config, manager) = setup(tmp.path());
        let spawner = AgentSpawner::new(&config);
        let watcher = Watcher::new(&manager, &spawner, 1);

        watcher.tick().expect("tick");
        assert!(!config.lock_path().exists());
    }

    #[test]
    fn tick_dispatches_queued_work() {
        let tmp = tempdir().expect("tempdir");
        let (config, manager) = setup(tmp.path());
        let spawner = AgentSpawner::new(&config);
        let watcher = Watcher::new(&manager, &spawner, 1);

        manager
            .create_task(CreateTask {
                task_id: "t1".to_string(),
                description: "work".to_string(),
                ..CreateTask::default()
            })
            .expect("create");

        watcher.tick().expect("tick");
        assert_eq!(manager.counts().in_progress, 1);
        assert_eq!(manager.counts().queued, 0);
    }

    #[test]
    fn interval_floor_is_one_second() {
        let tmp = tempdir().expect("tempdir");
        let (config, manager) = setup(tmp.path());
        let spawner = AgentSpawner::new(&config);
        let watcher = Watcher::new(&manager, &spawner, 0);
        assert_eq!(watcher.interval, Duration::from_secs(1));
    }
}
