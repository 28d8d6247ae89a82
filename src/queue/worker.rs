//! Child worker process.
//!
//! Claims one task at a time from the queue. Store I/O runs on a long-lived
//! control runtime; every job's bridge runs on a fresh current-thread
//! runtime that is dropped when the job ends. A watchdog thread enforces
//! the hard time limit by killing the toolkit and exiting the process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Runtime;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::agent::AgentRunner;
use crate::bridge::process::{self, Signal};
use crate::bridge::{BridgeRun, Teardown, ToolkitBridge};
use crate::config::{Config, QueueConfig, ToolkitConfig};
use crate::error::{AgentError, LlmError, QueueError};
use crate::jobs::runner::run_bridge;
use crate::jobs::{Begin, JobRunner, JobUpdate};
use crate::llm::LlmProvider;
use crate::queue::TaskQueue;
use crate::store::{Database, LibSqlBackend, QueuedTask};
use crate::tokens::TokenCounter;

/// Exit code of a worker killed by its own hard-limit watchdog.
pub const HARD_LIMIT_EXIT_CODE: i32 = 124;

/// Bound on the watchdog's best-effort `failed` write.
const HARD_LIMIT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the LLM provider for one job. Called on the job's own runtime.
pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn LlmProvider>, LlmError> + Send + Sync>;

/// Why a worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Processed its task budget and should be replaced.
    Recycle,
    /// Asked to stop.
    Shutdown,
}

/// What a child worker needs besides the store.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: QueueConfig,
    pub toolkit: ToolkitConfig,
    pub max_iterations: usize,
    pub tokenizer_model: String,
    /// Database file for the watchdog's own connection. `None` skips the
    /// hard-limit write.
    pub database_path: Option<PathBuf>,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.queue.clone(),
            toolkit: config.toolkit.clone(),
            max_iterations: config.llm.max_iterations,
            tokenizer_model: config.llm.tokenizer_model.clone(),
            database_path: Some(config.database_path.clone()),
        }
    }
}

pub struct ChildWorker {
    worker_id: String,
    slot: usize,
    queue: TaskQueue,
    runner: JobRunner,
    bridge: ToolkitBridge,
    pid_slot: Arc<AtomicU32>,
    settings: WorkerSettings,
    llm_factory: ProviderFactory,
    counter: Arc<TokenCounter>,
}

impl ChildWorker {
    pub fn new(
        slot: usize,
        db: Arc<dyn Database>,
        settings: WorkerSettings,
        llm_factory: ProviderFactory,
    ) -> Self {
        let pid_slot = Arc::new(AtomicU32::new(0));
        Self {
            worker_id: format!("worker-{slot}-{}", std::process::id()),
            slot,
            queue: TaskQueue::new(
                db.clone(),
                settings.queue.queue_name.clone(),
                settings.queue.visibility_timeout(),
            ),
            runner: JobRunner::new(db, settings.queue.result_expires),
            bridge: ToolkitBridge::new(settings.toolkit.clone()).with_pid_slot(pid_slot.clone()),
            pid_slot,
            counter: Arc::new(TokenCounter::for_model(&settings.tokenizer_model)),
            settings,
            llm_factory,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and process tasks until the task budget is spent or a shutdown
    /// signal arrives. A signal received mid-task lets the task finish.
    pub fn run(&self, control: &Runtime) -> Result<WorkerExit, QueueError> {
        let mut shutdown = ShutdownListener::install(control)?;
        let budget = self.settings.queue.max_tasks_per_child;
        info!(
            worker_id = %self.worker_id,
            queue = %self.queue.name(),
            budget,
            "Worker started"
        );

        let mut processed = 0u32;
        while processed < budget {
            match control.block_on(self.queue.claim(&self.worker_id))? {
                Some(task) => {
                    self.process(control, task)?;
                    processed += 1;
                    if control.block_on(shutdown.pending()) {
                        info!(worker_id = %self.worker_id, processed, "Worker stopping");
                        return Ok(WorkerExit::Shutdown);
                    }
                }
                None => {
                    let poll = self.settings.queue.poll_interval;
                    let stop = control.block_on(async {
                        tokio::select! {
                            _ = shutdown.wait() => true,
                            _ = tokio::time::sleep(poll) => false,
                        }
                    });
                    if stop {
                        info!(worker_id = %self.worker_id, processed, "Worker stopping");
                        return Ok(WorkerExit::Shutdown);
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, processed, "Task budget spent, recycling worker");
        Ok(WorkerExit::Recycle)
    }

    /// Run one claimed task to a terminal state.
    pub fn process(&self, control: &Runtime, task: QueuedTask) -> Result<(), QueueError> {
        let span = info_span!("job", job_id = %task.job_id, slot = self.slot);
        let _enter = span.enter();

        if let Begin::Skip(_) = control.block_on(self.runner.begin(&task))? {
            return Ok(());
        }

        let watchdog = HardLimitWatchdog::arm(
            self.settings.queue.hard_time_limit,
            self.hard_limit_action(&task),
        );
        let run = self.run_isolated(&task);
        let status = control.block_on(self.runner.finish(&task, &run.outcome))?;
        watchdog.disarm();

        debug!(%status, teardown = ?run.teardown, "Task finished");
        Ok(())
    }

    /// Run the bridge on a runtime that lives only for this job.
    fn run_isolated(&self, task: &QueuedTask) -> BridgeRun {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => return not_started(AgentError::Start(format!("job runtime: {e}"))),
        };

        let run = rt.block_on(async {
            let llm = match (self.llm_factory)() {
                Ok(llm) => llm,
                Err(e) => return not_started(AgentError::Execution(e.to_string())),
            };
            let handler = AgentRunner::new(llm, self.counter.clone(), self.settings.max_iterations);
            run_bridge(&self.bridge, task, &handler, self.settings.queue.soft_time_limit).await
        });
        rt.shutdown_timeout(Duration::from_secs(1));
        run
    }

    fn hard_limit_action(&self, task: &QueuedTask) -> Box<dyn FnOnce() + Send> {
        let pid_slot = self.pid_slot.clone();
        let job_id = task.job_id;
        let limit = self.settings.queue.hard_time_limit;
        let database_path = self.settings.database_path.clone();
        Box::new(move || {
            let pid = pid_slot.load(Ordering::SeqCst);
            error!(
                %job_id,
                pid,
                limit_secs = limit.as_secs(),
                "Hard time limit exceeded, killing worker"
            );
            if pid != 0 {
                process::kill_group(pid, Signal::Kill);
            }
            if let Some(path) = database_path {
                record_hard_limit_failure(&path, job_id, limit);
            }
            std::process::exit(HARD_LIMIT_EXIT_CODE);
        })
    }
}

/// Outcome of a job whose toolkit was never spawned.
fn not_started(error: AgentError) -> BridgeRun {
    BridgeRun {
        outcome: Err(error),
        teardown: Teardown {
            process_exited: true,
            reader_stopped: true,
            ..Teardown::default()
        },
    }
}

/// Best-effort `failed` write over a fresh connection. Never overwrites a
/// terminal record.
fn record_hard_limit_failure(path: &Path, job_id: Uuid, limit: Duration) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(%job_id, "Cannot record hard-limit failure: {e}");
            return;
        }
    };
    let update = JobUpdate::Failed {
        error_message: format!(
            "task exceeded hard time limit of {}s; worker killed",
            limit.as_secs()
        ),
    };
    let result = rt.block_on(async {
        tokio::time::timeout(HARD_LIMIT_WRITE_TIMEOUT, async {
            let db = LibSqlBackend::new_local(path).await?;
            db.update_job(job_id, &update).await
        })
        .await
    });
    match result {
        Ok(Ok(outcome)) => info!(%job_id, ?outcome, "Recorded hard-limit failure"),
        Ok(Err(e)) => error!(%job_id, "Hard-limit failure write failed: {e}"),
        Err(_) => error!(%job_id, "Hard-limit failure write timed out"),
    }
}

/// Fires `on_expiry` on its own thread unless disarmed within `limit`.
pub struct HardLimitWatchdog {
    disarm: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HardLimitWatchdog {
    pub fn arm<F>(limit: Duration, on_expiry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("hard-limit".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(limit) {
                    on_expiry();
                }
            });
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Hard-limit watchdog not started: {e}");
                None
            }
        };
        Self {
            disarm: Some(tx),
            thread,
        }
    }

    pub fn disarm(self) {}
}

impl Drop for HardLimitWatchdog {
    fn drop(&mut self) {
        // Dropping the sender wakes the thread with Disconnected.
        self.disarm.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// SIGTERM/SIGINT listener on the control runtime.
struct ShutdownListener {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
    #[cfg(unix)]
    int: tokio::signal::unix::Signal,
}

impl ShutdownListener {
    #[cfg(unix)]
    fn install(control: &Runtime) -> Result<Self, QueueError> {
        use tokio::signal::unix::{SignalKind, signal};
        let _guard = control.enter();
        let term = signal(SignalKind::terminate())
            .map_err(|e| QueueError::Runtime(format!("SIGTERM handler: {e}")))?;
        let int = signal(SignalKind::interrupt())
            .map_err(|e| QueueError::Runtime(format!("SIGINT handler: {e}")))?;
        Ok(Self { term, int })
    }

    #[cfg(not(unix))]
    fn install(_control: &Runtime) -> Result<Self, QueueError> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn wait(&mut self) {
        tokio::select! {
            _ = self.term.recv() => {}
            _ = self.int.recv() => {}
        }
    }

    #[cfg(not(unix))]
    async fn wait(&mut self) {
        let _ = tokio::signal::ctrl_c().await;
    }

    /// Whether a signal has already arrived.
    async fn pending(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.wait() => true,
            _ = std::future::ready(()) => false,
        }
    }
}
