//! TestRun persistence and retry-chain lookup.
//!
//! `original_run_id` is a back-reference to the attempt-0 run of a chain, not
//! an ownership edge; the chain is reassembled through its index.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{RetryMode, Termination};
use crate::executor::{ExecutionOutcome, FailureDetail, StepResult};
use crate::storage::{self, json_column, parse_opt_ts, parse_ts, with_conn, Pool, StorageError};

/// A new attempt about to execute.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub project_id: i64,
    pub test_case_id: i64,
    pub scheduled_run_id: Option<i64>,
    pub thread_id: Option<String>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    pub original_run_id: Option<i64>,
    pub retry_mode: RetryMode,
    pub retry_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRunRecord {
    pub id: i64,
    pub project_id: i64,
    pub test_case_id: i64,
    pub scheduled_run_id: Option<i64>,
    pub thread_id: Option<String>,
    pub status: String,
    pub retry_attempt: u32,
    pub max_retries: u32,
    pub original_run_id: Option<i64>,
    pub retry_mode: RetryMode,
    pub retry_reason: Option<String>,
    pub termination: Option<Termination>,
    pub failure_detail: Option<FailureDetail>,
    pub step_results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TestRunRecord {
    /// Id of the chain root (itself for attempt 0).
    pub fn root_id(&self) -> i64 {
        self.original_run_id.unwrap_or(self.id)
    }
}

const COLUMNS: &str = "id, project_id, test_case_id, scheduled_run_id, thread_id, status, retry_attempt,
     max_retries, original_run_id, retry_mode, retry_reason, termination, failure_detail,
     step_results_json, started_at, completed_at";

type RawRun = (
    (i64, i64, i64, Option<i64>, Option<String>, String, i64, i64),
    (Option<i64>, String, Option<String>, Option<String>, Option<String>, Option<String>, String, Option<String>),
);

fn read(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok((
        (
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ),
        (
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
            row.get(12)?,
            row.get(13)?,
            row.get(14)?,
            row.get(15)?,
        ),
    ))
}

fn into_record(raw: RawRun) -> Result<TestRunRecord, StorageError> {
    let ((id, project_id, test_case_id, scheduled_run_id, thread_id, status, attempt, max),
        (original, mode, reason, termination, failure, steps, started, completed)) = raw;
    let retry_mode = RetryMode::parse(&mode).ok_or(StorageError::Corrupt {
        column: "test_runs.retry_mode",
        value: mode.clone(),
    })?;
    let termination = match termination {
        Some(t) => Some(Termination::parse(&t).ok_or(StorageError::Corrupt {
            column: "test_runs.termination",
            value: t.clone(),
        })?),
        None => None,
    };
    Ok(TestRunRecord {
        id,
        project_id,
        test_case_id,
        scheduled_run_id,
        thread_id,
        status,
        retry_attempt: u32::try_from(attempt).unwrap_or(0),
        max_retries: u32::try_from(max).unwrap_or(0),
        original_run_id: original,
        retry_mode,
        retry_reason: reason,
        termination,
        failure_detail: failure.map(|f| serde_json::from_str(&f)).transpose()?,
        step_results: json_column(steps)?,
        started_at: parse_ts("started_at", &started)?,
        completed_at: parse_opt_ts("completed_at", completed)?,
    })
}

#[derive(Clone)]
pub struct RetryLedger {
    pool: Pool,
}

impl RetryLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert a `running` TestRun for an attempt and return its id.
    pub async fn start_attempt(&self, attempt: NewAttempt, now: DateTime<Utc>) -> Result<i64, StorageError> {
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO test_runs (project_id, test_case_id, scheduled_run_id, thread_id, status,
                    retry_attempt, max_retries, original_run_id, retry_mode, retry_reason, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    attempt.project_id,
                    attempt.test_case_id,
                    attempt.scheduled_run_id,
                    attempt.thread_id,
                    attempt.retry_attempt,
                    attempt.max_retries,
                    attempt.original_run_id,
                    attempt.retry_mode.as_str(),
                    attempt.retry_reason,
                    storage::ts(now),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Record an attempt's outcome and how its chain continues.
    pub async fn finish_attempt(
        &self,
        run_id: i64,
        outcome: &ExecutionOutcome,
        termination: Termination,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let status = if outcome.passed { "passed" } else { "failed" };
        let failure = outcome
            .failure
            .as_ref()
            .filter(|_| !outcome.passed)
            .map(serde_json::to_string)
            .transpose()?;
        let steps = serde_json::to_string(&outcome.step_results)?;
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "UPDATE test_runs SET status = ?2, termination = ?3, failure_detail = ?4,
                    step_results_json = ?5, completed_at = ?6
                 WHERE id = ?1",
                params![run_id, status, termination.as_str(), failure, steps, storage::ts(now)],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, run_id: i64) -> Result<Option<TestRunRecord>, StorageError> {
        with_conn(&self.pool, move |conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM test_runs WHERE id = ?1"),
                params![run_id],
                read,
            )
            .optional()?
            .map(into_record)
            .transpose()
        })
        .await
    }

    /// Every attempt of the chain rooted at `root_id`, ordered by attempt.
    pub async fn chain(&self, root_id: i64) -> Result<Vec<TestRunRecord>, StorageError> {
        with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM test_runs
                 WHERE id = ?1 OR original_run_id = ?1
                 ORDER BY retry_attempt ASC"
            ))?;
            let rows = stmt.query_map(params![root_id], read)?;
            let mut chain = Vec::new();
            for r in rows {
                chain.push(into_record(r?)?);
            }
            Ok(chain)
        })
        .await
    }

    /// The chain containing `run_id`, whichever attempt it is.
    pub async fn chain_of(&self, run_id: i64) -> Result<Vec<TestRunRecord>, StorageError> {
        match self.get(run_id).await? {
            Some(run) => self.chain(run.root_id()).await,
            None => Err(StorageError::NotFound {
                entity: "test run",
                id: run_id,
            }),
        }
    }

    /// TestRuns created for one scheduled run.
    pub async fn for_scheduled_run(&self, scheduled_run_id: i64) -> Result<Vec<TestRunRecord>, StorageError> {
        with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM test_runs WHERE scheduled_run_id = ?1
                 ORDER BY test_case_id, retry_attempt"
            ))?;
            let rows = stmt.query_map(params![scheduled_run_id], read)?;
            let mut list = Vec::new();
            for r in rows {
                list.push(into_record(r?)?);
            }
            Ok(list)
        })
        .await
    }
}
