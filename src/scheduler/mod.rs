//! Persisted schedules and due-schedule selection.
//!
//! `next_run_at` is the single source of truth for "when does this fire".
//! It is computed on creation and re-enable, advanced atomically when the
//! driver claims a due schedule, and cleared while the schedule is disabled.

pub mod cron;
pub mod engine;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::executor::Browser;
use crate::retry::RetryMode;
use crate::storage::{self, json_column, parse_opt_ts, parse_ts, with_conn, Pool, StorageError};

pub use self::cron::CronError;

/// Upper bound on preview entries per schedule.
const PREVIEW_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    InvalidCronExpression(#[from] CronError),
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("schedule {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a schedule runs. Tag targets are resolved each time the schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target_type", rename_all = "snake_case")]
pub enum TargetSelector {
    TestCaseIds {
        #[serde(rename = "target_test_case_ids")]
        ids: Vec<i64>,
    },
    Tags {
        #[serde(rename = "target_tags")]
        tags: Vec<String>,
    },
}

impl TargetSelector {
    pub fn kind(&self) -> &'static str {
        match self {
            TargetSelector::TestCaseIds { .. } => "test_case_ids",
            TargetSelector::Tags { .. } => "tags",
        }
    }

    fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            TargetSelector::TestCaseIds { ids } if ids.is_empty() => Err(ScheduleError::InvalidTarget(
                "test_case_ids target needs at least one test case id".into(),
            )),
            TargetSelector::Tags { tags } if tags.iter().all(|t| t.trim().is_empty()) => Err(
                ScheduleError::InvalidTarget("tags target needs at least one tag".into()),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub timezone: String,
    #[serde(flatten)]
    pub target: TargetSelector,
    pub browser: Option<Browser>,
    pub retry_max: u32,
    pub retry_mode: RetryMode,
    pub enabled: bool,
    pub notification_channel_ids: Vec<i64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(flatten)]
    pub target: TargetSelector,
    #[serde(default)]
    pub browser: Option<Browser>,
    #[serde(default)]
    pub retry_max: u32,
    #[serde(default)]
    pub retry_mode: RetryMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notification_channel_ids: Vec<i64>,
}

/// One upcoming fire in a dry-run preview.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewEntry {
    pub at: DateTime<Utc>,
    pub schedule_id: i64,
    pub name: String,
}

/// Next fire strictly after `after` for a stored expression/timezone pair.
pub fn next_fire(expr: &str, timezone: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let parsed = cron::parse(expr)?;
    let tz = cron::parse_timezone(timezone).ok_or_else(|| ScheduleError::InvalidTimezone(timezone.to_string()))?;
    Ok(cron::compute_next_fire(&parsed, tz, after))
}

const SCHEDULE_COLUMNS: &str = "id, project_id, name, description, cron_expression, timezone, target_type,
     target_test_case_ids_json, target_tags_json, browser, retry_max, retry_mode, enabled,
     notification_channel_ids_json, last_run_at, next_run_at, created_at, updated_at";

struct ScheduleRow {
    id: i64,
    project_id: i64,
    name: String,
    description: Option<String>,
    cron_expression: String,
    timezone: String,
    target_type: String,
    target_ids: Option<String>,
    target_tags: Option<String>,
    browser: Option<String>,
    retry_max: i64,
    retry_mode: String,
    enabled: bool,
    channel_ids: Option<String>,
    last_run_at: Option<String>,
    next_run_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            cron_expression: row.get(4)?,
            timezone: row.get(5)?,
            target_type: row.get(6)?,
            target_ids: row.get(7)?,
            target_tags: row.get(8)?,
            browser: row.get(9)?,
            retry_max: row.get(10)?,
            retry_mode: row.get(11)?,
            enabled: row.get(12)?,
            channel_ids: row.get(13)?,
            last_run_at: row.get(14)?,
            next_run_at: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_schedule(self) -> Result<Schedule, StorageError> {
        let target = match self.target_type.as_str() {
            "test_case_ids" => Some(TargetSelector::TestCaseIds {
                ids: json_column(self.target_ids)?,
            }),
            "tags" => Some(TargetSelector::Tags {
                tags: json_column(self.target_tags)?,
            }),
            _ => None,
        };
        let Some(target) = target else {
            return Err(StorageError::Corrupt {
                column: "schedules.target_type",
                value: self.target_type,
            });
        };
        let retry_mode = RetryMode::parse(&self.retry_mode).ok_or(StorageError::Corrupt {
            column: "schedules.retry_mode",
            value: self.retry_mode.clone(),
        })?;
        Ok(Schedule {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            description: self.description,
            cron_expression: self.cron_expression,
            timezone: self.timezone,
            target,
            browser: self.browser.map(Browser::new),
            retry_max: u32::try_from(self.retry_max).unwrap_or(0),
            retry_mode,
            enabled: self.enabled,
            notification_channel_ids: json_column(self.channel_ids)?,
            last_run_at: parse_opt_ts("last_run_at", self.last_run_at)?,
            next_run_at: parse_opt_ts("next_run_at", self.next_run_at)?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
        })
    }
}

fn load(conn: &rusqlite::Connection, id: i64) -> Result<Option<Schedule>, StorageError> {
    conn.query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
        params![id],
        ScheduleRow::read,
    )
    .optional()?
    .map(ScheduleRow::into_schedule)
    .transpose()
}

fn load_where(conn: &rusqlite::Connection, clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Schedule>, StorageError> {
    let mut stmt = conn.prepare(&format!("SELECT {SCHEDULE_COLUMNS} FROM schedules {clause}"))?;
    let rows = stmt.query_map(args, ScheduleRow::read)?;
    let mut list = Vec::new();
    for r in rows {
        list.push(r?.into_schedule()?);
    }
    Ok(list)
}

/// A scheduler that persists schedules in SQLite and selects due ones.
#[derive(Clone)]
pub struct Scheduler {
    pool: Pool,
}

impl Scheduler {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Validate and store a new schedule. Cron, timezone and target errors
    /// surface here and never at fire time.
    pub async fn add(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        new.target.validate()?;
        let next = next_fire(&new.cron_expression, &new.timezone, now)?;
        let next_run_at = if new.enabled { next } else { None };

        let (ids, tags) = match &new.target {
            TargetSelector::TestCaseIds { ids } => (Some(serde_json::to_string(ids).map_err(StorageError::from)?), None),
            TargetSelector::Tags { tags } => (None, Some(serde_json::to_string(tags).map_err(StorageError::from)?)),
        };
        let channels = serde_json::to_string(&new.notification_channel_ids).map_err(StorageError::from)?;
        let n = new.clone();

        let id = with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO schedules (project_id, name, description, cron_expression, timezone, target_type,
                    target_test_case_ids_json, target_tags_json, browser, retry_max, retry_mode, enabled,
                    notification_channel_ids_json, next_run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
                params![
                    n.project_id,
                    n.name,
                    n.description,
                    n.cron_expression,
                    n.timezone,
                    n.target.kind(),
                    ids,
                    tags,
                    n.browser.as_ref().map(|b| b.as_str().to_string()),
                    n.retry_max,
                    n.retry_mode.as_str(),
                    n.enabled,
                    channels,
                    next_run_at.map(storage::ts),
                    storage::ts(now),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?;

        info!(schedule_id = id, name = %new.name, cron = %new.cron_expression, tz = %new.timezone, next_run_at = ?next_run_at, "schedule created");
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Schedule, ScheduleError> {
        with_conn(&self.pool, move |conn| load(conn, id))
            .await?
            .ok_or(ScheduleError::NotFound(id))
    }

    /// List schedules, optionally for one project.
    pub async fn list(&self, project_id: Option<i64>) -> Result<Vec<Schedule>, ScheduleError> {
        Ok(with_conn(&self.pool, move |conn| match project_id {
            Some(p) => load_where(conn, "WHERE project_id = ?1 ORDER BY id", &[&p]),
            None => load_where(conn, "ORDER BY id", &[]),
        })
        .await?)
    }

    pub async fn remove(&self, id: i64) -> Result<(), ScheduleError> {
        let changed = with_conn(&self.pool, move |conn| {
            Ok(conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?)
        })
        .await?;
        if changed == 0 {
            return Err(ScheduleError::NotFound(id));
        }
        info!(schedule_id = id, "schedule removed");
        Ok(())
    }

    /// Enable or disable a schedule.
    ///
    /// Re-enabling computes the next occurrence after the last fire, so a
    /// schedule that missed occurrences while disabled becomes due once and
    /// then moves on; it never replays the backlog.
    pub async fn set_enabled(&self, id: i64, enabled: bool, now: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        let schedule = self.get(id).await?;
        let next_run_at = if enabled {
            let base = schedule.last_run_at.unwrap_or(now);
            next_fire(&schedule.cron_expression, &schedule.timezone, base)?
        } else {
            None
        };
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "UPDATE schedules SET enabled = ?2, next_run_at = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, enabled, next_run_at.map(storage::ts), storage::ts(now)],
            )?;
            Ok(())
        })
        .await?;
        info!(schedule_id = id, enabled, next_run_at = ?next_run_at, "schedule toggled");
        self.get(id).await
    }

    /// Enabled schedules with `next_run_at <= now`, oldest-due first.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ScheduleError> {
        let now = storage::ts(now);
        Ok(with_conn(&self.pool, move |conn| {
            load_where(
                conn,
                "WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1 ORDER BY next_run_at ASC, id ASC",
                &[&now],
            )
        })
        .await?)
    }

    /// Claim one due occurrence of `schedule`.
    ///
    /// Advances `next_run_at` to the first occurrence strictly after `now`
    /// with a compare-and-set on the value the caller observed. Returns the
    /// updated schedule when this caller won, `None` when the schedule was
    /// already claimed, disabled or edited in between.
    pub async fn claim(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<Schedule>, ScheduleError> {
        let Some(observed) = schedule.next_run_at else {
            return Ok(None);
        };
        let next = match next_fire(&schedule.cron_expression, &schedule.timezone, now) {
            Ok(next) => next,
            Err(e) => {
                // Stored expressions were validated on creation; a bad one here means an out-of-band edit.
                warn!(schedule_id = schedule.id, error = %e, "stored schedule no longer evaluates, parking it");
                None
            }
        };
        if next.is_none() {
            warn!(schedule_id = schedule.id, "schedule has no future occurrence");
        }

        let id = schedule.id;
        let changed = with_conn(&self.pool, move |conn| {
            Ok(conn.execute(
                "UPDATE schedules SET next_run_at = ?3, last_run_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND enabled = 1 AND next_run_at = ?2",
                params![id, storage::ts(observed), next.map(storage::ts), storage::ts(now)],
            )?)
        })
        .await?;

        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.get(id).await?))
    }

    /// Dry-run preview of every enabled schedule's fires in the next `hours`.
    pub async fn preview(&self, hours: u64, now: DateTime<Utc>) -> Result<Vec<PreviewEntry>, ScheduleError> {
        let end = now + Duration::hours(i64::try_from(hours).unwrap_or(i64::MAX / 3600).min(24 * 366));
        let schedules = self.list(None).await?;

        let mut preview = Vec::new();
        for s in schedules.into_iter().filter(|s| s.enabled) {
            let (Ok(parsed), Some(tz)) = (cron::parse(&s.cron_expression), cron::parse_timezone(&s.timezone)) else {
                warn!(schedule_id = s.id, "skipping unparseable schedule in preview");
                continue;
            };
            for at in cron::preview(&parsed, tz, now, end, PREVIEW_LIMIT) {
                preview.push(PreviewEntry {
                    at,
                    schedule_id: s.id,
                    name: s.name.clone(),
                });
            }
        }

        // Sort by time
        preview.sort_by(|a, b| a.at.cmp(&b.at).then(a.schedule_id.cmp(&b.schedule_id)));
        Ok(preview)
    }
}
