//! SQLite storage layer -- pool, schema, and shared row helpers.

pub mod catalog;
pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use thiserror::Error;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("blocking storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: String },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool, StorageError> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Corrupt {
                column: "database path",
                value: format!("{}: {}", parent.display(), e),
            })?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Run `f` against a pooled connection on the blocking thread pool.
pub async fn with_conn<T, F>(pool: &Pool, f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&conn)
    })
    .await?
}

/// Format a timestamp for storage. Fixed precision keeps lexical order equal to time order.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(column: &'static str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::Corrupt {
            column,
            value: raw.to_string(),
        })
}

pub fn parse_opt_ts(
    column: &'static str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.map(|r| parse_ts(column, &r)).transpose()
}

/// Decode a JSON text column, treating NULL as the type's default.
pub fn json_column<T>(raw: Option<String>) -> Result<T, StorageError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match raw {
        Some(text) if !text.is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(T::default()),
    }
}
