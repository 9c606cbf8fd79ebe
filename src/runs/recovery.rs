//! Liveness sweep for runs orphaned by a crashed or restarted orchestrator.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::{info, warn};

use crate::retry::Termination;
use crate::storage::{self, with_conn, Pool, StorageError};

pub const RESTART_REASON: &str = "orchestrator restarted";

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub runs: Vec<i64>,
    pub test_runs: usize,
}

/// Fail every pending/running ScheduledRun that started more than `threshold`
/// ago, along with the TestRuns it left running.
pub async fn sweep(pool: &Pool, threshold: Duration, now: DateTime<Utc>) -> Result<SweepReport, StorageError> {
    let cutoff = storage::ts(now - threshold);
    let now = storage::ts(now);
    let report = with_conn(pool, move |conn| {
        let tx = conn.unchecked_transaction()?;
        let runs: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM scheduled_runs
                 WHERE status IN ('pending', 'running') AND coalesce(started_at, created_at) < ?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut test_runs = 0;
        for id in &runs {
            tx.execute(
                "UPDATE scheduled_runs SET status = 'failed', status_reason = ?2, completed_at = ?3 WHERE id = ?1",
                params![id, RESTART_REASON, now],
            )?;
            test_runs += tx.execute(
                "UPDATE test_runs SET status = 'failed', termination = ?2, completed_at = ?3
                 WHERE scheduled_run_id = ?1 AND status = 'running'",
                params![id, Termination::OrchestratorRestarted.as_str(), now],
            )?;
        }
        tx.commit()?;
        Ok(SweepReport { runs, test_runs })
    })
    .await?;

    if report.runs.is_empty() {
        info!("recovery sweep found no orphaned runs");
    } else {
        warn!(runs = ?report.runs, test_runs = report.test_runs, "marked orphaned runs failed");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ledger::{NewAttempt, RetryLedger};
    use crate::retry::RetryMode;
    use crate::runs::{store, RunStatus};
    use crate::scheduler::{testing::new_schedule, Scheduler, TargetSelector};
    use crate::storage::{catalog, testing::temp_pool};

    #[tokio::test]
    async fn test_only_stale_runs_are_failed() {
        let (_dir, pool) = temp_pool();
        let project = catalog::insert_project(&pool, "shop", None).await.unwrap();
        let tc = catalog::insert_test_case(&pool, None, project, "login", &[], &[], &[]).await.unwrap();
        let schedule = Scheduler::new(pool.clone())
            .add(new_schedule(project, "0 9 * * *", TargetSelector::TestCaseIds { ids: vec![tc] }), Utc::now())
            .await
            .unwrap();

        let now = Utc::now();
        let stale = store::insert_run(&pool, &schedule, "t-stale", now - Duration::hours(3)).await.unwrap();
        store::mark_running(&pool, stale, 1, now - Duration::hours(3)).await.unwrap();
        let fresh = store::insert_run(&pool, &schedule, "t-fresh", now - Duration::minutes(5)).await.unwrap();
        store::mark_running(&pool, fresh, 1, now - Duration::minutes(5)).await.unwrap();

        let ledger = RetryLedger::new(pool.clone());
        let orphan = ledger
            .start_attempt(
                NewAttempt {
                    project_id: project,
                    test_case_id: tc,
                    scheduled_run_id: Some(stale),
                    thread_id: Some("t-stale".into()),
                    retry_attempt: 0,
                    max_retries: 0,
                    original_run_id: None,
                    retry_mode: RetryMode::Simple,
                    retry_reason: None,
                },
                now - Duration::hours(3),
            )
            .await
            .unwrap();

        let report = sweep(&pool, Duration::hours(1), now).await.unwrap();
        assert_eq!(report.runs, vec![stale]);
        assert_eq!(report.test_runs, 1);

        let run = store::get_run(&pool, stale).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.status_reason.as_deref(), Some(RESTART_REASON));
        assert_eq!(store::get_run(&pool, fresh).await.unwrap().unwrap().status, RunStatus::Running);

        let attempt = ledger.get(orphan).await.unwrap().unwrap();
        assert_eq!(attempt.termination, Some(Termination::OrchestratorRestarted));

        // Idempotent.
        assert!(sweep(&pool, Duration::hours(1), now).await.unwrap().runs.is_empty());
    }

    #[tokio::test]
    async fn test_later_sweep_fails_run_that_was_young_earlier() {
        let (_dir, pool) = temp_pool();
        let project = catalog::insert_project(&pool, "shop", None).await.unwrap();
        let tc = catalog::insert_test_case(&pool, None, project, "login", &[], &[], &[]).await.unwrap();
        let schedule = Scheduler::new(pool.clone())
            .add(new_schedule(project, "0 9 * * *", TargetSelector::TestCaseIds { ids: vec![tc] }), Utc::now())
            .await
            .unwrap();

        let startup = Utc::now();
        let run = store::insert_run(&pool, &schedule, "t-young", startup - Duration::minutes(10)).await.unwrap();
        store::mark_running(&pool, run, 1, startup - Duration::minutes(10)).await.unwrap();

        assert!(sweep(&pool, Duration::hours(1), startup).await.unwrap().runs.is_empty());
        let later = sweep(&pool, Duration::hours(1), startup + Duration::hours(1)).await.unwrap();
        assert_eq!(later.runs, vec![run]);
        assert_eq!(store::get_run(&pool, run).await.unwrap().unwrap().status, RunStatus::Failed);
    }
}
