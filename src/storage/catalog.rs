//! Read access to the application's catalog: projects, test cases, fixtures
//! and notification channels. These are owned by the surrounding application;
//! the orchestrator only looks them up (the `insert_*` helpers exist for
//! seeding and tests).

use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::{json_column, with_conn, Pool, StorageError};
use crate::executor::{Environment, TestCase};
use crate::fixtures::{Fixture, FixtureScope};
use crate::notify::{ChannelKind, NotificationChannel, NotifyOn};

const TEST_CASE_COLUMNS: &str = "id, project_id, name, steps_json, tags_json, fixture_ids_json";

fn test_case_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, String, String, Option<String>, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_test_case(
    raw: (i64, i64, String, String, Option<String>, Option<String>),
) -> Result<TestCase, StorageError> {
    let (id, project_id, name, steps, tags, fixture_ids) = raw;
    Ok(TestCase {
        id,
        project_id,
        name,
        steps: json_column::<Vec<Value>>(Some(steps))?,
        tags: json_column(tags)?,
        fixture_ids: json_column(fixture_ids)?,
    })
}

/// The project's execution environment (base URL; no variables are stored yet).
pub async fn environment(pool: &Pool, project_id: i64) -> Result<Environment, StorageError> {
    with_conn(pool, move |conn| {
        let base_url = conn
            .query_row(
                "SELECT base_url FROM projects WHERE id = ?1",
                params![project_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .ok_or(StorageError::NotFound {
                entity: "project",
                id: project_id,
            })?;
        Ok(Environment {
            base_url,
            ..Environment::default()
        })
    })
    .await
}

/// Test cases of `project_id` whose ids are in `ids`, in the order of `ids`.
/// Ids that do not exist (or belong to another project) are omitted.
pub async fn test_cases_by_ids(
    pool: &Pool,
    project_id: i64,
    ids: &[i64],
) -> Result<Vec<TestCase>, StorageError> {
    let wanted = serde_json::to_string(ids)?;
    let ids = ids.to_vec();
    with_conn(pool, move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {TEST_CASE_COLUMNS} FROM test_cases
             WHERE project_id = ?1 AND id IN (SELECT value FROM json_each(?2))"
        ))?;
        let rows = stmt.query_map(params![project_id, wanted], test_case_from_row)?;
        let mut found = Vec::new();
        for r in rows {
            found.push(into_test_case(r?)?);
        }
        let mut ordered = Vec::with_capacity(found.len());
        for id in ids {
            if let Some(pos) = found.iter().position(|tc| tc.id == id) {
                ordered.push(found.swap_remove(pos));
            }
        }
        Ok(ordered)
    })
    .await
}

/// Active test cases of `project_id` carrying ANY of `tags`, ordered by id.
pub async fn test_cases_by_tags(
    pool: &Pool,
    project_id: i64,
    tags: &[String],
) -> Result<Vec<TestCase>, StorageError> {
    let wanted = serde_json::to_string(tags)?;
    with_conn(pool, move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {TEST_CASE_COLUMNS} FROM test_cases tc
             WHERE tc.project_id = ?1 AND tc.status = 'active'
               AND EXISTS (
                   SELECT 1 FROM json_each(coalesce(tc.tags_json, '[]')) t
                   WHERE t.value IN (SELECT value FROM json_each(?2))
               )
             ORDER BY tc.id"
        ))?;
        let rows = stmt.query_map(params![project_id, wanted], test_case_from_row)?;
        let mut list = Vec::new();
        for r in rows {
            list.push(into_test_case(r?)?);
        }
        Ok(list)
    })
    .await
}

pub async fn get_fixture(pool: &Pool, fixture_id: i64) -> Result<Option<Fixture>, StorageError> {
    with_conn(pool, move |conn| {
        let row = conn
            .query_row(
                "SELECT id, project_id, name, setup_steps_json, scope, cache_ttl_seconds
                 FROM fixtures WHERE id = ?1",
                params![fixture_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, project_id, name, steps, scope, ttl)) = row else {
            return Ok(None);
        };
        let scope = FixtureScope::parse(&scope).ok_or(StorageError::Corrupt {
            column: "fixtures.scope",
            value: scope,
        })?;
        Ok(Some(Fixture {
            id,
            project_id,
            name,
            setup_steps: json_column(Some(steps))?,
            scope,
            cache_ttl_seconds: ttl,
        }))
    })
    .await
}

pub async fn get_channel(pool: &Pool, channel_id: i64) -> Result<Option<NotificationChannel>, StorageError> {
    with_conn(pool, move |conn| {
        let row = conn
            .query_row(
                "SELECT id, project_id, name, channel_type, enabled, webhook_url, webhook_template,
                        email_recipients_json, email_template, notify_on
                 FROM notification_channels WHERE id = ?1",
                params![channel_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, project_id, name, kind, enabled, webhook_url, webhook_template, recipients, email_template, notify_on)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(NotificationChannel {
            id,
            project_id,
            name,
            kind: ChannelKind::parse(&kind).ok_or(StorageError::Corrupt {
                column: "notification_channels.channel_type",
                value: kind,
            })?,
            enabled,
            webhook_url,
            webhook_template,
            email_recipients: json_column(recipients)?,
            email_template,
            notify_on: NotifyOn::parse(&notify_on).ok_or(StorageError::Corrupt {
                column: "notification_channels.notify_on",
                value: notify_on,
            })?,
        }))
    })
    .await
}

pub async fn insert_project(pool: &Pool, name: &str, base_url: Option<&str>) -> Result<i64, StorageError> {
    let name = name.to_string();
    let base_url = base_url.map(str::to_string);
    with_conn(pool, move |conn| {
        conn.execute(
            "INSERT INTO projects (name, base_url) VALUES (?1, ?2)",
            params![name, base_url],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await
}

/// Insert a test case; `id` pins the row id when given.
pub async fn insert_test_case(
    pool: &Pool,
    id: Option<i64>,
    project_id: i64,
    name: &str,
    steps: &[Value],
    tags: &[String],
    fixture_ids: &[i64],
) -> Result<i64, StorageError> {
    let name = name.to_string();
    let steps = serde_json::to_string(steps)?;
    let tags = serde_json::to_string(tags)?;
    let fixture_ids = serde_json::to_string(fixture_ids)?;
    with_conn(pool, move |conn| {
        conn.execute(
            "INSERT INTO test_cases (id, project_id, name, steps_json, tags_json, fixture_ids_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, project_id, name, steps, tags, fixture_ids],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await
}

pub async fn insert_fixture(
    pool: &Pool,
    project_id: i64,
    name: &str,
    setup_steps: &[Value],
    scope: FixtureScope,
    cache_ttl_seconds: i64,
) -> Result<i64, StorageError> {
    let name = name.to_string();
    let steps = serde_json::to_string(setup_steps)?;
    with_conn(pool, move |conn| {
        conn.execute(
            "INSERT INTO fixtures (project_id, name, setup_steps_json, scope, cache_ttl_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project_id, name, steps, scope.as_str(), cache_ttl_seconds],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await
}

/// Insert a channel; the `id` field of `channel` is ignored.
pub async fn insert_channel(pool: &Pool, channel: &NotificationChannel) -> Result<i64, StorageError> {
    let c = channel.clone();
    let recipients = serde_json::to_string(&c.email_recipients)?;
    with_conn(pool, move |conn| {
        conn.execute(
            "INSERT INTO notification_channels
                (project_id, name, channel_type, enabled, webhook_url, webhook_template,
                 email_recipients_json, email_template, notify_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                c.project_id,
                c.name,
                c.kind.as_str(),
                c.enabled,
                c.webhook_url,
                c.webhook_template,
                recipients,
                c.email_template,
                c.notify_on.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::temp_pool;
    use serde_json::json;

    async fn seed(pool: &Pool) -> i64 {
        let project = insert_project(pool, "shop", Some("https://shop.test")).await.unwrap();
        for (id, name, tags) in [
            (10, "login", vec!["smoke"]),
            (11, "checkout", vec!["regression", "payments"]),
            (12, "search", vec!["smoke", "regression"]),
        ] {
            let tags: Vec<String> = tags.into_iter().map(String::from).collect();
            insert_test_case(pool, Some(id), project, name, &[json!({"action": "goto"})], &tags, &[])
                .await
                .unwrap();
        }
        project
    }

    #[tokio::test]
    async fn test_ids_keep_requested_order_and_skip_missing() {
        let (_dir, pool) = temp_pool();
        let project = seed(&pool).await;
        let cases = test_cases_by_ids(&pool, project, &[12, 99, 10]).await.unwrap();
        let ids: Vec<i64> = cases.iter().map(|tc| tc.id).collect();
        assert_eq!(ids, vec![12, 10]);
        assert_eq!(cases[0].steps.len(), 1);
    }

    #[tokio::test]
    async fn test_tags_match_any_active_case() {
        let (_dir, pool) = temp_pool();
        let project = seed(&pool).await;
        pool.get()
            .unwrap()
            .execute("UPDATE test_cases SET status = 'archived' WHERE id = 12", [])
            .unwrap();

        let smoke = test_cases_by_tags(&pool, project, &["smoke".into()]).await.unwrap();
        assert_eq!(smoke.iter().map(|tc| tc.id).collect::<Vec<_>>(), vec![10]);

        let any = test_cases_by_tags(&pool, project, &["payments".into(), "smoke".into()])
            .await
            .unwrap();
        assert_eq!(any.iter().map(|tc| tc.id).collect::<Vec<_>>(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_environment_requires_project() {
        let (_dir, pool) = temp_pool();
        let project = seed(&pool).await;
        let env = environment(&pool, project).await.unwrap();
        assert_eq!(env.base_url.as_deref(), Some("https://shop.test"));
        assert!(matches!(
            environment(&pool, 404).await,
            Err(StorageError::NotFound { entity: "project", id: 404 })
        ));
    }

    #[tokio::test]
    async fn test_fixture_and_channel_roundtrip() {
        let (_dir, pool) = temp_pool();
        let project = seed(&pool).await;
        let fid = insert_fixture(&pool, project, "login", &[json!({"action": "fill"})], FixtureScope::Fresh, 60)
            .await
            .unwrap();
        let fixture = get_fixture(&pool, fid).await.unwrap().unwrap();
        assert_eq!(fixture.scope, FixtureScope::Fresh);
        assert_eq!(fixture.cache_ttl_seconds, 60);
        assert!(get_fixture(&pool, fid + 1).await.unwrap().is_none());

        let channel = NotificationChannel {
            id: 0,
            project_id: project,
            name: "ops".into(),
            kind: ChannelKind::Email,
            enabled: true,
            webhook_url: None,
            webhook_template: None,
            email_recipients: vec!["ops@shop.test".into()],
            email_template: None,
            notify_on: NotifyOn::Always,
        };
        let cid = insert_channel(&pool, &channel).await.unwrap();
        let loaded = get_channel(&pool, cid).await.unwrap().unwrap();
        assert_eq!(loaded.kind, ChannelKind::Email);
        assert_eq!(loaded.email_recipients, vec!["ops@shop.test".to_string()]);
        assert_eq!(loaded.notify_on, NotifyOn::Always);
    }
}
