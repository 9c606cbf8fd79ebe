//! Database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            base_url TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS test_cases (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            steps_json TEXT NOT NULL DEFAULT '[]',
            tags_json TEXT,
            fixture_ids_json TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS fixtures (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            setup_steps_json TEXT NOT NULL DEFAULT '[]',
            scope TEXT NOT NULL DEFAULT 'cached',
            cache_ttl_seconds INTEGER NOT NULL DEFAULT 3600,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS fixture_states (
            id INTEGER PRIMARY KEY,
            fixture_id INTEGER NOT NULL REFERENCES fixtures(id) ON DELETE CASCADE,
            project_id INTEGER NOT NULL,
            browser TEXT NOT NULL,
            url TEXT,
            encrypted_state TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            UNIQUE (fixture_id, browser)
        );

        CREATE TABLE IF NOT EXISTS notification_channels (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            channel_type TEXT NOT NULL DEFAULT 'webhook'
                CHECK (channel_type IN ('webhook', 'slack', 'email')),
            enabled INTEGER NOT NULL DEFAULT 1,
            webhook_url TEXT,
            webhook_template TEXT,
            email_recipients_json TEXT,
            email_template TEXT,
            notify_on TEXT NOT NULL DEFAULT 'failure'
                CHECK (notify_on IN ('failure', 'success', 'always')),
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            description TEXT,
            cron_expression TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            target_type TEXT NOT NULL,
            target_test_case_ids_json TEXT,
            target_tags_json TEXT,
            browser TEXT,
            retry_max INTEGER NOT NULL DEFAULT 0,
            retry_mode TEXT NOT NULL DEFAULT 'simple',
            enabled INTEGER NOT NULL DEFAULT 1,
            notification_channel_ids_json TEXT,
            last_run_at TEXT,
            next_run_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scheduled_runs (
            id INTEGER PRIMARY KEY,
            schedule_id INTEGER NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
            project_id INTEGER NOT NULL,
            thread_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            status_reason TEXT,
            test_count INTEGER NOT NULL DEFAULT 0,
            pass_count INTEGER NOT NULL DEFAULT 0,
            fail_count INTEGER NOT NULL DEFAULT 0,
            notifications_sent TEXT,
            notification_errors TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS test_runs (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL,
            test_case_id INTEGER NOT NULL REFERENCES test_cases(id) ON DELETE CASCADE,
            scheduled_run_id INTEGER REFERENCES scheduled_runs(id) ON DELETE SET NULL,
            thread_id TEXT,
            status TEXT NOT NULL DEFAULT 'running',
            retry_attempt INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            original_run_id INTEGER,
            retry_mode TEXT NOT NULL,
            retry_reason TEXT,
            termination TEXT,
            failure_detail TEXT,
            step_results_json TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS scheduled_run_targets (
            scheduled_run_id INTEGER NOT NULL REFERENCES scheduled_runs(id) ON DELETE CASCADE,
            test_case_id INTEGER NOT NULL,
            terminal_run_id INTEGER NOT NULL,
            passed INTEGER NOT NULL,
            termination TEXT NOT NULL,
            PRIMARY KEY (scheduled_run_id, test_case_id)
        );

        CREATE INDEX IF NOT EXISTS idx_test_cases_project ON test_cases(project_id);
        CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(enabled, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_scheduled_runs_schedule ON scheduled_runs(schedule_id);
        CREATE INDEX IF NOT EXISTS idx_scheduled_runs_status ON scheduled_runs(status);
        CREATE INDEX IF NOT EXISTS idx_test_runs_original ON test_runs(original_run_id);
        CREATE INDEX IF NOT EXISTS idx_test_runs_scheduled ON test_runs(scheduled_run_id);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in [
            "schedules",
            "scheduled_runs",
            "test_runs",
            "fixture_states",
            "notification_channels",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should start empty");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_fixture_state_is_unique_per_browser() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO projects (id, name) VALUES (1, 'p');
             INSERT INTO fixtures (id, project_id, name) VALUES (1, 1, 'login');
             INSERT INTO fixture_states (fixture_id, project_id, browser, encrypted_state, captured_at, expires_at)
                VALUES (1, 1, 'chromium', 'x', 'a', 'b');",
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO fixture_states (fixture_id, project_id, browser, encrypted_state, captured_at, expires_at)
                VALUES (1, 1, 'chromium', 'y', 'a', 'b')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_channel_enums_are_checked() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute("INSERT INTO projects (id, name) VALUES (1, 'p')", []).unwrap();

        let bad_kind = conn.execute(
            "INSERT INTO notification_channels (project_id, name, channel_type) VALUES (1, 'x', 'pager')",
            [],
        );
        assert!(bad_kind.is_err());
        let bad_policy = conn.execute(
            "INSERT INTO notification_channels (project_id, name, notify_on) VALUES (1, 'x', 'sometimes')",
            [],
        );
        assert!(bad_policy.is_err());
        conn.execute(
            "INSERT INTO notification_channels (project_id, name, channel_type, notify_on) VALUES (1, 'x', 'slack', 'always')",
            [],
        )
        .unwrap();
    }
}
