//! Durable task queue and the worker pool that drains it.
//!
//! ```text
//!   supervisor ──spawns──▶ worker --child --slot 0 ─┐
//!       │                  worker --child --slot 1 ─┼─▶ claim ▶ run ▶ ack
//!       └─ cron ─▶ retention sweep                  ┘
//! ```

pub mod supervisor;
pub mod sweep;
pub mod worker;

pub use supervisor::Supervisor;
pub use sweep::{SweepReport, run_retention_sweep, spawn_sweep_ticker};
pub use worker::{ChildWorker, HARD_LIMIT_EXIT_CODE, WorkerExit};

use std::sync::Arc;
use std::time::Duration;

use crate::error::DatabaseError;
use crate::store::{Database, QueuedTask};

/// One named queue over the store.
#[derive(Clone)]
pub struct TaskQueue {
    db: Arc<dyn Database>,
    name: String,
    visibility_timeout: Duration,
}

impl TaskQueue {
    pub fn new(db: Arc<dyn Database>, name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            db,
            name: name.into(),
            visibility_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim the next deliverable task for `worker_id`. Only one task is
    /// held at a time.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<QueuedTask>, DatabaseError> {
        self.db
            .claim_task(&self.name, worker_id, self.visibility_timeout)
            .await
    }
}
