//! Worker pool supervisor.
//!
//! Keeps `concurrency` child worker processes alive, replaces any that exit,
//! runs the retention sweep on its cron schedule, and on shutdown forwards
//! SIGTERM to the children and waits for them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::bridge::process::{Signal, is_alive, kill_process};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::queue::sweep::spawn_sweep_ticker;
use crate::queue::worker::HARD_LIMIT_EXIT_CODE;
use crate::store::Database;

/// Delay before replacing a worker that exited abnormally.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

pub struct Supervisor {
    exe: PathBuf,
    queue: QueueConfig,
    db: Arc<dyn Database>,
}

type Exit = (usize, std::io::Result<ExitStatus>);

impl Supervisor {
    /// `exe` is the binary started as `exe worker --child --slot N`.
    pub fn new(exe: PathBuf, queue: QueueConfig, db: Arc<dyn Database>) -> Self {
        Self { exe, queue, db }
    }

    pub async fn run(self) -> Result<(), QueueError> {
        let sweep = spawn_sweep_ticker(
            self.db.clone(),
            self.queue.sweep_schedule.clone(),
            self.queue.retention_days,
        );

        let mut running: JoinSet<Exit> = JoinSet::new();
        let mut pids: HashMap<usize, u32> = HashMap::new();
        for slot in 0..self.queue.concurrency {
            self.spawn_child(slot, &mut running, &mut pids)?;
        }
        info!(
            workers = self.queue.concurrency,
            queue = %self.queue.queue_name,
            "Worker pool started"
        );

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = running.join_next() => {
                    let (slot, status) = match joined {
                        Ok(exit) => exit,
                        Err(e) => {
                            error!("Worker monitor task failed: {e}");
                            continue;
                        }
                    };
                    pids.remove(&slot);
                    if !self.log_exit(slot, &status) {
                        tokio::time::sleep(RESPAWN_BACKOFF).await;
                    }
                    if let Err(e) = self.spawn_child(slot, &mut running, &mut pids) {
                        error!(slot, "Failed to replace worker: {e}");
                    }
                }
            }
        }

        sweep.abort();
        info!(workers = pids.len(), "Stopping worker pool");
        for (&slot, &pid) in &pids {
            kill_process(pid, Signal::Term);
            info!(slot, pid, "Sent SIGTERM to worker");
        }

        let force = shutdown_signal();
        tokio::pin!(force);
        let mut forced = false;
        loop {
            tokio::select! {
                joined = running.join_next() => match joined {
                    Some(Ok((slot, status))) => {
                        self.log_exit(slot, &status);
                    }
                    Some(Err(e)) => error!("Worker monitor task failed: {e}"),
                    None => break,
                },
                _ = &mut force, if !forced => {
                    forced = true;
                    warn!("Second signal, killing workers");
                    for &pid in pids.values() {
                        if is_alive(pid) {
                            kill_process(pid, Signal::Kill);
                        }
                    }
                }
            }
        }
        info!("Worker pool stopped");
        Ok(())
    }

    fn spawn_child(
        &self,
        slot: usize,
        running: &mut JoinSet<Exit>,
        pids: &mut HashMap<usize, u32>,
    ) -> Result<(), QueueError> {
        let mut child = Command::new(&self.exe)
            .args(["worker", "--child", "--slot", &slot.to_string()])
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| QueueError::WorkerSpawn {
                slot,
                reason: e.to_string(),
            })?;
        if let Some(pid) = child.id() {
            pids.insert(slot, pid);
            info!(slot, pid, "Worker spawned");
        }
        running.spawn(async move { (slot, child.wait().await) });
        Ok(())
    }

    /// Log a worker exit. Returns true for a clean exit.
    fn log_exit(&self, slot: usize, status: &std::io::Result<ExitStatus>) -> bool {
        match status {
            Ok(s) if s.success() => {
                info!(slot, "Worker recycled");
                true
            }
            Ok(s) if s.code() == Some(HARD_LIMIT_EXIT_CODE) => {
                warn!(
                    slot,
                    limit_secs = self.queue.hard_time_limit.as_secs(),
                    "Worker killed by hard time limit"
                );
                false
            }
            Ok(s) => {
                warn!(slot, status = %s, "Worker exited abnormally");
                false
            }
            Err(e) => {
                error!(slot, "Lost track of worker: {e}");
                false
            }
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
