//! Run coordination: turning a fired schedule into a ScheduledRun.
//!
//! A fire snapshots its targets once, runs every target's retry chain
//! concurrently (bounded per project), aggregates the terminal attempts and
//! hands the finished run to the notification dispatcher.

pub mod pool;
pub mod recovery;
pub mod store;

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use self::pool::WorkerPool;
use crate::executor::{Browser, TestCase};
use crate::notify::Dispatcher;
use crate::retry::{RetryError, RetryOrchestrator, RetryPolicy, RetryRequest, TargetOutcome};
use crate::scheduler::{Schedule, ScheduleError, Scheduler, TargetSelector};
use crate::storage::{catalog, Pool, StorageError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl From<RetryError> for RunError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Storage(s) => RunError::Storage(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "partial" => Some(RunStatus::Partial),
            _ => None,
        }
    }

    /// Terminal status from the final attempt of every target.
    pub fn aggregate(pass: u32, fail: u32) -> Self {
        if fail == 0 {
            RunStatus::Completed
        } else if pass == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledRun {
    pub id: i64,
    pub schedule_id: i64,
    pub project_id: i64,
    pub thread_id: String,
    pub status: RunStatus,
    pub status_reason: Option<String>,
    pub test_count: u32,
    pub pass_count: u32,
    pub fail_count: u32,
    pub notifications_sent: Vec<i64>,
    pub notification_errors: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Correlation id shared by a run and its TestRuns.
fn thread_id(schedule_id: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("scheduled-{}-{}", schedule_id, &suffix[..8])
}

#[derive(Clone)]
pub struct Coordinator {
    pool: Pool,
    orchestrator: RetryOrchestrator,
    dispatcher: Dispatcher,
    workers: WorkerPool,
    default_browser: Browser,
}

impl Coordinator {
    pub fn new(
        pool: Pool,
        orchestrator: RetryOrchestrator,
        dispatcher: Dispatcher,
        workers: WorkerPool,
        default_browser: Browser,
    ) -> Self {
        Self {
            pool,
            orchestrator,
            dispatcher,
            workers,
            default_browser,
        }
    }

    pub fn orchestrator(&self) -> &RetryOrchestrator {
        &self.orchestrator
    }

    /// Fire `schedule` now. Storage failures are fatal to this fire only; the
    /// run row is marked failed on a best-effort basis before returning.
    pub async fn fire(&self, schedule: &Schedule) -> Result<ScheduledRun, RunError> {
        let thread_id = thread_id(schedule.id);
        let span = info_span!("fire", schedule_id = schedule.id, thread_id = %thread_id);
        async {
            let run_id = store::insert_run(&self.pool, schedule, &thread_id, Utc::now()).await?;
            info!(run_id, "scheduled run created");

            let run = match self.execute(schedule, run_id, &thread_id).await {
                Ok(run) => run,
                Err(e) => {
                    error!(run_id, error = %e, "scheduled run aborted by storage failure");
                    let reason = format!("storage failure: {e}");
                    if let Err(mark) = store::finish_run(&self.pool, run_id, RunStatus::Failed, 0, 0, Some(&reason), Utc::now()).await {
                        error!(run_id, error = %mark, "could not mark aborted run failed");
                    }
                    return Err(e);
                }
            };

            if let Err(e) = self.dispatcher.dispatch(schedule, &run).await {
                warn!(run_id, error = %e, "could not record notification outcomes");
            }
            Ok(store::get_run(&self.pool, run_id).await?.unwrap_or(run))
        }
        .instrument(span)
        .await
    }

    /// Fire a schedule on demand, enabled or not, leaving `next_run_at` alone.
    pub async fn trigger(&self, scheduler: &Scheduler, schedule_id: i64) -> Result<ScheduledRun, RunError> {
        let schedule = scheduler.get(schedule_id).await?;
        info!(schedule_id, "manual trigger");
        self.fire(&schedule).await
    }

    /// The test cases a fire runs, snapshotted once.
    async fn resolve_targets(&self, schedule: &Schedule) -> Result<Vec<TestCase>, StorageError> {
        let cases = match &schedule.target {
            TargetSelector::TestCaseIds { ids } => {
                let found = catalog::test_cases_by_ids(&self.pool, schedule.project_id, ids).await?;
                for missing in ids.iter().filter(|id| !found.iter().any(|tc| tc.id == **id)) {
                    warn!(test_case_id = missing, "scheduled test case not found, skipping");
                }
                found
            }
            TargetSelector::Tags { tags } => catalog::test_cases_by_tags(&self.pool, schedule.project_id, tags).await?,
        };
        let mut seen = HashSet::new();
        Ok(cases.into_iter().filter(|tc| seen.insert(tc.id)).collect())
    }

    async fn execute(&self, schedule: &Schedule, run_id: i64, thread_id: &str) -> Result<ScheduledRun, RunError> {
        let targets = self.resolve_targets(schedule).await?;
        let environment = catalog::environment(&self.pool, schedule.project_id).await?;
        let test_count = u32::try_from(targets.len()).unwrap_or(u32::MAX);
        store::mark_running(&self.pool, run_id, test_count, Utc::now()).await?;
        if targets.is_empty() {
            warn!(run_id, "no test cases matched, completing empty run");
        } else {
            info!(run_id, targets = targets.len(), "scheduled run started");
        }

        let browser = schedule.browser.clone().unwrap_or_else(|| self.default_browser.clone());
        let policy = RetryPolicy {
            mode: schedule.retry_mode,
            max_retries: schedule.retry_max,
        };

        let chains = targets.iter().map(|tc| {
            let request = RetryRequest {
                test_case: tc,
                environment: &environment,
                browser: &browser,
                policy,
                scheduled_run_id: Some(run_id),
                thread_id: Some(thread_id),
            };
            async move {
                let outcome = self
                    .workers
                    .run(schedule.project_id, self.orchestrator.run(request))
                    .await?;
                store::record_target(&self.pool, run_id, &outcome).await?;
                Ok::<TargetOutcome, RunError>(outcome)
            }
        });
        let results = futures::future::join_all(chains).await;

        let (mut pass, mut fail) = (0u32, 0u32);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(o) if o.passed => pass += 1,
                Ok(_) => fail += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let status = RunStatus::aggregate(pass, fail);
        store::finish_run(&self.pool, run_id, status, pass, fail, None, Utc::now()).await?;
        info!(run_id, status = status.as_str(), pass, fail, "scheduled run finished");

        store::get_run(&self.pool, run_id).await?.ok_or(RunError::Storage(StorageError::NotFound {
            entity: "scheduled run",
            id: run_id,
        }))
    }
}
