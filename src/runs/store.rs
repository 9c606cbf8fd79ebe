//! ScheduledRun rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{RunStatus, ScheduledRun};
use crate::retry::TargetOutcome;
use crate::scheduler::Schedule;
use crate::storage::{self, json_column, parse_opt_ts, parse_ts, with_conn, Pool, StorageError};

const COLUMNS: &str = "id, schedule_id, project_id, thread_id, status, status_reason, test_count, pass_count,
     fail_count, notifications_sent, notification_errors, created_at, started_at, completed_at";

type RawRun = (
    (i64, i64, i64, String, String, Option<String>, i64),
    (i64, i64, Option<String>, Option<String>, String, Option<String>, Option<String>),
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
        ),
        (
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
            row.get(12)?,
            row.get(13)?,
        ),
    ))
}

fn count(raw: i64) -> u32 {
    u32::try_from(raw).unwrap_or(0)
}

fn into_run(raw: RawRun) -> Result<ScheduledRun, StorageError> {
    let ((id, schedule_id, project_id, thread_id, status, status_reason, test_count),
        (pass, fail, sent, errors, created, started, completed)) = raw;
    let status = RunStatus::parse(&status).ok_or(StorageError::Corrupt {
        column: "scheduled_runs.status",
        value: status.clone(),
    })?;
    Ok(ScheduledRun {
        id,
        schedule_id,
        project_id,
        thread_id,
        status,
        status_reason,
        test_count: count(test_count),
        pass_count: count(pass),
        fail_count: count(fail),
        notifications_sent: json_column(sent)?,
        notification_errors: json_column::<BTreeMap<String, String>>(errors)?,
        created_at: parse_ts("created_at", &created)?,
        started_at: parse_opt_ts("started_at", started)?,
        completed_at: parse_opt_ts("completed_at", completed)?,
    })
}

/// Create the `pending` row for a fire.
pub async fn insert_run(pool: &Pool, schedule: &Schedule, thread_id: &str, now: DateTime<Utc>) -> Result<i64, StorageError> {
    let (schedule_id, project_id, thread_id) = (schedule.id, schedule.project_id, thread_id.to_string());
    with_conn(pool, move |conn| {
        conn.execute(
            "INSERT INTO scheduled_runs (schedule_id, project_id, thread_id, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![schedule_id, project_id, thread_id, storage::ts(now)],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await
}

pub async fn mark_running(pool: &Pool, run_id: i64, test_count: u32, now: DateTime<Utc>) -> Result<(), StorageError> {
    with_conn(pool, move |conn| {
        conn.execute(
            "UPDATE scheduled_runs SET status = 'running', test_count = ?2, started_at = ?3 WHERE id = ?1",
            params![run_id, test_count, storage::ts(now)],
        )?;
        Ok(())
    })
    .await
}

/// Set the terminal status and counts.
pub async fn finish_run(
    pool: &Pool,
    run_id: i64,
    status: RunStatus,
    pass: u32,
    fail: u32,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    let reason = reason.map(str::to_string);
    with_conn(pool, move |conn| {
        conn.execute(
            "UPDATE scheduled_runs
             SET status = ?2, pass_count = ?3, fail_count = ?4, status_reason = ?5, completed_at = ?6
             WHERE id = ?1",
            params![run_id, status.as_str(), pass, fail, reason, storage::ts(now)],
        )?;
        Ok(())
    })
    .await
}

/// Record which TestRun ended a target's chain.
pub async fn record_target(pool: &Pool, run_id: i64, outcome: &TargetOutcome) -> Result<(), StorageError> {
    let o = outcome.clone();
    with_conn(pool, move |conn| {
        conn.execute(
            "INSERT INTO scheduled_run_targets (scheduled_run_id, test_case_id, terminal_run_id, passed, termination)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, o.test_case_id, o.terminal_run_id, o.passed, o.termination.as_str()],
        )?;
        Ok(())
    })
    .await
}

/// `(test_case_id, terminal_run_id, passed)` per target of a run.
pub async fn targets(pool: &Pool, run_id: i64) -> Result<Vec<(i64, i64, bool)>, StorageError> {
    with_conn(pool, move |conn| {
        let mut stmt = conn.prepare(
            "SELECT test_case_id, terminal_run_id, passed FROM scheduled_run_targets
             WHERE scheduled_run_id = ?1 ORDER BY test_case_id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    })
    .await
}

pub async fn get_run(pool: &Pool, run_id: i64) -> Result<Option<ScheduledRun>, StorageError> {
    with_conn(pool, move |conn| {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM scheduled_runs WHERE id = ?1"),
            params![run_id],
            read,
        )
        .optional()?
        .map(into_run)
        .transpose()
    })
    .await
}

/// Most recent runs, optionally for one schedule.
pub async fn list_runs(pool: &Pool, schedule_id: Option<i64>, limit: u32) -> Result<Vec<ScheduledRun>, StorageError> {
    with_conn(pool, move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM scheduled_runs
             WHERE ?1 IS NULL OR schedule_id = ?1
             ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![schedule_id, limit], read)?;
        let mut list = Vec::new();
        for r in rows {
            list.push(into_run(r?)?);
        }
        Ok(list)
    })
    .await
}
