//! Toolkit bridge.
//!
//! Runs one agent turn against a freshly spawned toolkit subprocess and
//! always tears the subprocess down afterwards, whatever the turn's outcome:
//!
//! ```text
//! spawn (explicit env) ─▶ drain stderr ─▶ handshake ─▶ turn ─┐
//!                                                            ▼
//!                     stop reader ◀── SIGTERM/wait/SIGKILL ◀─ cleanup
//! ```

pub mod process;
pub mod protocol;

pub use protocol::{McpSession, ToolOutput, ToolSession};

use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::agent::AgentReply;
use crate::config::ToolkitConfig;
use crate::error::AgentError;
use crate::scopes::ToolkitEnv;

use process::Shutdown;

/// One agent turn over an initialized tool session.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn run_turn(
        &self,
        session: &mut dyn ToolSession,
        message: &str,
    ) -> Result<AgentReply, AgentError>;
}

/// What cleanup observed.
#[derive(Debug, Clone, Default)]
pub struct Teardown {
    /// Process id, if the toolkit was spawned at all.
    pub pid: Option<u32>,
    /// The toolkit was reaped.
    pub process_exited: bool,
    /// The diagnostic reader task has finished.
    pub reader_stopped: bool,
    pub exit_status: Option<ExitStatus>,
    /// The toolkit had to be signalled.
    pub forced: bool,
}

/// Outcome of one bridge run plus the cleanup record.
#[derive(Debug)]
pub struct BridgeRun {
    pub outcome: Result<AgentReply, AgentError>,
    pub teardown: Teardown,
}

/// Spawns and supervises the toolkit for a single turn.
pub struct ToolkitBridge {
    config: ToolkitConfig,
    /// Published while a toolkit is alive, zero otherwise.
    pid_slot: Option<Arc<AtomicU32>>,
}

impl ToolkitBridge {
    pub fn new(config: ToolkitConfig) -> Self {
        Self {
            config,
            pid_slot: None,
        }
    }

    /// Publish the live toolkit pid into `slot` so an outside watchdog can
    /// kill it.
    pub fn with_pid_slot(mut self, slot: Arc<AtomicU32>) -> Self {
        self.pid_slot = Some(slot);
        self
    }

    /// Run `message` through `handler` with the toolkit configured by `env`.
    ///
    /// Cancelling `cancel` abandons the turn with [`AgentError::Timeout`];
    /// cleanup still runs. Never panics and never returns before the
    /// toolkit has been reaped.
    pub async fn run(
        &self,
        env: &ToolkitEnv,
        message: &str,
        handler: &dyn TurnHandler,
        cancel: &CancellationToken,
    ) -> BridgeRun {
        let started = Instant::now();
        let vars = process::child_environment(&self.config, env, |k| std::env::var(k).ok());

        let mut child = match process::spawn(&self.config, &vars) {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "Toolkit failed to start");
                return BridgeRun {
                    outcome: Err(e),
                    teardown: Teardown {
                        process_exited: true,
                        reader_stopped: true,
                        ..Teardown::default()
                    },
                };
            }
        };
        // spawn() only returns children that have a pid.
        let pid = child.id().unwrap_or_default();
        self.publish_pid(pid);
        info!(
            pid,
            scopes = env.authorized_scopes.len(),
            "Toolkit started"
        );

        let reader = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(process::drain_diagnostics(stderr, pid).in_current_span()));

        let outcome = match (child.stdout.take(), child.stdin.take()) {
            (Some(stdout), Some(stdin)) => {
                let exchange = async {
                    let mut session = McpSession::initialize(BufReader::new(stdout), stdin).await?;
                    debug!(pid, server = %session.server_info(), "Toolkit handshake complete");
                    handler.run_turn(&mut session, message).await
                };
                tokio::select! {
                    result = exchange => result,
                    _ = cancel.cancelled() => {
                        warn!(pid, "Turn cancelled, stopping toolkit");
                        Err(AgentError::Timeout(started.elapsed()))
                    }
                }
            }
            _ => Err(AgentError::Start("toolkit stdio was not captured".to_string())),
        };

        // Cleanup: stop the reader first, then the process.
        let mut teardown = Teardown {
            pid: Some(pid),
            ..Teardown::default()
        };
        match reader {
            Some(handle) => {
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!(pid, error = %e, "Toolkit diagnostic reader failed");
                    }
                }
                teardown.reader_stopped = true;
            }
            None => teardown.reader_stopped = true,
        }

        let (shutdown, status) =
            process::terminate(&mut child, pid, self.config.shutdown_grace).await;
        teardown.forced = shutdown != Shutdown::AlreadyExited;
        teardown.exit_status = status;
        teardown.process_exited = status.is_some() || !process::is_alive(pid);
        self.publish_pid(0);

        // A toolkit that died on its own is the cause behind a broken exchange.
        let outcome = match (outcome, status) {
            (Err(e), Some(status)) if shutdown == Shutdown::AlreadyExited => {
                Err(with_exit_status(e, status))
            }
            (outcome, _) => outcome,
        };

        info!(
            pid,
            ?shutdown,
            ok = outcome.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Toolkit stopped"
        );

        BridgeRun { outcome, teardown }
    }

    fn publish_pid(&self, pid: u32) {
        if let Some(slot) = &self.pid_slot {
            slot.store(pid, Ordering::SeqCst);
        }
    }
}

fn with_exit_status(err: AgentError, status: ExitStatus) -> AgentError {
    match err {
        AgentError::Protocol(msg) => {
            AgentError::Protocol(format!("{msg} (toolkit exited with {status})"))
        }
        AgentError::Execution(msg) => {
            AgentError::Execution(format!("{msg} (toolkit exited with {status})"))
        }
        other => other,
    }
}
