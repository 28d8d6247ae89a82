//! Retention sweep: bulk-delete old job records and expired result
//! metadata.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::error::DatabaseError;
use crate::store::Database;

/// Counts removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub jobs_deleted: usize,
    pub results_purged: usize,
}

/// Delete job records created more than `retention_days` before `now`, and
/// task results that expired before `now`. Zero matches is not an error.
pub async fn run_retention_sweep(
    db: &dyn Database,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<SweepReport, DatabaseError> {
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    let jobs_deleted = db.delete_jobs_created_before(cutoff).await?;
    let results_purged = db.purge_expired_task_results(now).await?;
    info!("Cleaned up {jobs_deleted} old job records");
    if results_purged > 0 {
        info!(results_purged, "Purged expired task results");
    }
    Ok(SweepReport {
        jobs_deleted,
        results_purged,
    })
}

/// Next fire time of a cron expression after now.
pub fn next_sweep(schedule: &str) -> Result<Option<DateTime<Utc>>, String> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(schedule.upcoming(Utc).next())
}

/// Spawn the sweep ticker. Sweep failures are logged and the ticker keeps
/// going.
pub fn spawn_sweep_ticker(
    db: Arc<dyn Database>,
    schedule: String,
    retention_days: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = match next_sweep(&schedule) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    error!(%schedule, "Sweep schedule has no upcoming fire time, ticker stopped");
                    return;
                }
                Err(e) => {
                    error!(%schedule, "Sweep ticker stopped: {e}");
                    return;
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if let Err(e) = run_retention_sweep(db.as_ref(), retention_days, Utc::now()).await {
                error!("Retention sweep failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::store::LibSqlBackend;
    use uuid::Uuid;

    #[tokio::test]
    async fn sweep_with_nothing_to_delete() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let report = run_retention_sweep(&db, 7, Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn sweep_deletes_only_old_records() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let job = db.create_job("u1", "recent").await.unwrap();

        // Eight days from now, the fresh record is past the seven-day horizon.
        let later = Utc::now() + chrono::Duration::days(8);
        let report = run_retention_sweep(&db, 7, Utc::now()).await.unwrap();
        assert_eq!(report.jobs_deleted, 0);
        assert!(db.get_job_by_id(job.id).await.unwrap().is_some());

        let report = run_retention_sweep(&db, 7, later).await.unwrap();
        assert_eq!(report.jobs_deleted, 1);
        assert!(db.get_job_by_id(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_purges_expired_results() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        db.record_task_result(
            Uuid::new_v4(),
            Uuid::new_v4(),
            JobStatus::Completed,
            now - chrono::Duration::seconds(1),
        )
        .await
        .unwrap();
        let report = run_retention_sweep(&db, 7, now).await.unwrap();
        assert_eq!(report.results_purged, 1);
    }

    #[test]
    fn default_schedule_fires() {
        assert!(next_sweep("0 0 * * * *").unwrap().is_some());
        assert!(next_sweep("not a cron").is_err());
    }
}
