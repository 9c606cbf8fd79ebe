use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::runs::{recovery, Coordinator, RunError, ScheduledRun};
use crate::scheduler::{ScheduleError, Scheduler};

/// One driver tick: claim every due schedule and fire each on its own task.
///
/// Returns the spawned fires so callers (and tests) may await them; the
/// driver itself never does.
pub async fn tick_once(
    scheduler: &Scheduler,
    coordinator: &Coordinator,
    now: DateTime<Utc>,
) -> Result<Vec<JoinHandle<Result<ScheduledRun, RunError>>>, ScheduleError> {
    let due = scheduler.due(now).await?;
    let mut fires = Vec::with_capacity(due.len());

    for schedule in due {
        // Claim BEFORE execution so the occurrence cannot fire twice
        let claimed = match scheduler.claim(&schedule, now).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(schedule_id = schedule.id, "schedule already claimed");
                continue;
            }
            Err(e) => {
                error!(schedule_id = schedule.id, error = %e, "failed to claim schedule");
                continue;
            }
        };
        info!(schedule_id = claimed.id, name = %claimed.name, next_run_at = ?claimed.next_run_at, "schedule due");

        let coordinator = coordinator.clone();
        fires.push(tokio::spawn(async move {
            let result = coordinator.fire(&claimed).await;
            if let Err(e) = &result {
                error!(schedule_id = claimed.id, error = %e, "scheduled fire failed");
            }
            result
        }));
    }
    Ok(fires)
}

/// Main scheduler execution loop.
/// Polls for due schedules every `tick` until `shutdown` flips to true, and
/// re-runs the liveness sweep once per `liveness` so runs orphaned after
/// startup are failed too.
pub async fn run_scheduler_loop(
    scheduler: Scheduler,
    coordinator: Coordinator,
    tick: Duration,
    liveness: chrono::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(tick = ?tick, liveness_secs = liveness.num_seconds(), "Scheduler engine started");

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Startup already swept; the first periodic sweep waits a full period.
    let sweep_every = liveness.to_std().unwrap_or(tick).max(tick);
    let mut sweeps = tokio::time::interval_at(tokio::time::Instant::now() + sweep_every, sweep_every);
    sweeps.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = sweeps.tick() => {
                if let Err(e) = recovery::sweep(scheduler.pool(), liveness, Utc::now()).await {
                    warn!(error = %e, "periodic liveness sweep failed");
                }
                continue;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Scheduler engine stopping");
                    return;
                }
                continue;
            }
        }

        match tick_once(&scheduler, &coordinator, Utc::now()).await {
            Ok(fires) if !fires.is_empty() => debug!(fired = fires.len(), "tick dispatched fires"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to check due schedules"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{transport::Transport, DeliveryError, Dispatcher};
    use crate::retry::classifier::RuleClassifier;
    use crate::retry::ledger::RetryLedger;
    use crate::retry::testing::{fixture_cache, timeouts, ScriptedExecutor};
    use crate::retry::RetryOrchestrator;
    use crate::runs::pool::WorkerPool;
    use crate::runs::{store, RunStatus};
    use crate::scheduler::{testing::new_schedule, TargetSelector};
    use crate::storage::{catalog, testing::temp_pool, Pool};
    use crate::executor::Browser;
    use std::sync::Arc;

    struct NullTransport;

    #[async_trait::async_trait]
    impl Transport for NullTransport {
        async fn send_webhook(&self, _u: &str, _b: &serde_json::Value) -> Result<(), DeliveryError> {
            Ok(())
        }
        async fn send_email(&self, _r: &[String], _s: &str, _b: &str) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn coordinator(pool: &Pool) -> Coordinator {
        Coordinator::new(
            pool.clone(),
            RetryOrchestrator::new(
                RetryLedger::new(pool.clone()),
                ScriptedExecutor::new(vec![]),
                Arc::new(RuleClassifier),
                fixture_cache(pool),
                timeouts(),
                true,
            ),
            Dispatcher::new(pool.clone(), Arc::new(NullTransport), Duration::from_secs(5)),
            WorkerPool::new(4),
            Browser::default(),
        )
    }

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_backlog_fires_once() {
        let (_dir, pool) = temp_pool();
        let project = catalog::insert_project(&pool, "shop", None).await.unwrap();
        let tc = catalog::insert_test_case(&pool, None, project, "login", &[], &[], &[]).await.unwrap();
        let scheduler = Scheduler::new(pool.clone());
        let schedule = scheduler
            .add(
                new_schedule(project, "*/5 * * * *", TargetSelector::TestCaseIds { ids: vec![tc] }),
                utc("2025-06-01T00:01:00Z"),
            )
            .await
            .unwrap();
        let coord = coordinator(&pool);

        // Driver was down for an hour: twelve occurrences missed.
        let now = utc("2025-06-01T01:02:00Z");
        let fires = tick_once(&scheduler, &coord, now).await.unwrap();
        assert_eq!(fires.len(), 1);
        let run = fires.into_iter().next().unwrap().await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.pass_count, 1);

        assert!(tick_once(&scheduler, &coord, now).await.unwrap().is_empty());
        let after = scheduler.get(schedule.id).await.unwrap();
        assert_eq!(after.next_run_at, Some(utc("2025-06-01T01:05:00Z")));
        assert_eq!(store::list_runs(&pool, Some(schedule.id), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let (_dir, pool) = temp_pool();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_scheduler_loop(
            Scheduler::new(pool.clone()),
            coordinator(&pool),
            Duration::from_millis(10),
            chrono::Duration::hours(1),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_loop_sweeps_runs_orphaned_after_startup() {
        let (_dir, pool) = temp_pool();
        let project = catalog::insert_project(&pool, "shop", None).await.unwrap();
        let tc = catalog::insert_test_case(&pool, None, project, "login", &[], &[], &[]).await.unwrap();
        let scheduler = Scheduler::new(pool.clone());
        let schedule = scheduler
            .add(
                new_schedule(project, "0 9 1 1 *", TargetSelector::TestCaseIds { ids: vec![tc] }),
                Utc::now(),
            )
            .await
            .unwrap();

        // Young when the loop starts, so the startup sweep would leave it.
        let started = Utc::now();
        let run = store::insert_run(&pool, &schedule, "t-orphan", started).await.unwrap();
        store::mark_running(&pool, run, 1, started).await.unwrap();
        assert!(recovery::sweep(&pool, chrono::Duration::milliseconds(100), started)
            .await
            .unwrap()
            .runs
            .is_empty());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_scheduler_loop(
            scheduler,
            coordinator(&pool),
            Duration::from_millis(10),
            chrono::Duration::milliseconds(100),
            rx,
        ));

        let mut status = RunStatus::Running;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = store::get_run(&pool, run).await.unwrap().unwrap().status;
            if status != RunStatus::Running {
                break;
            }
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert_eq!(status, RunStatus::Failed);
        let failed = store::get_run(&pool, run).await.unwrap().unwrap();
        assert_eq!(failed.status_reason.as_deref(), Some(recovery::RESTART_REASON));
    }
}
