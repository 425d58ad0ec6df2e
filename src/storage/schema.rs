//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sites (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            success_url TEXT NOT NULL,
            username TEXT NOT NULL,
            password TEXT NOT NULL,
            take_screenshot INTEGER NOT NULL DEFAULT 0,
            paused INTEGER NOT NULL DEFAULT 0,
            custom_script TEXT,
            date_minutes_start INTEGER NOT NULL,
            date_minutes_end INTEGER,
            allowed_time_minutes_start INTEGER,
            allowed_time_minutes_end INTEGER,
            next_schedule TEXT,
            added_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS action_history (
            id INTEGER PRIMARY KEY,
            site_id INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
            execution_started TEXT NOT NULL,
            execution_ended TEXT,
            status TEXT NOT NULL,
            failure TEXT,
            message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sites_next_schedule ON sites(next_schedule);
        CREATE INDEX IF NOT EXISTS idx_history_site_started ON action_history(site_id, execution_started);
        CREATE INDEX IF NOT EXISTS idx_history_status ON action_history(status);",
    )?;

    // Migration: screenshots were added after the first release.
    let has_screenshot: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('action_history') WHERE name='screenshot_id'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if has_screenshot == 0 {
        conn.execute("ALTER TABLE action_history ADD COLUMN screenshot_id TEXT", [])?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
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

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sites", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM action_history WHERE screenshot_id IS NULL", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_history_rows_cascade_with_site() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO sites (name, url, success_url, username, password, date_minutes_start, added_at)
             VALUES ('a', 'u', 's', 'x', 'y', 1440, '2026-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO action_history (site_id, execution_started, status)
             VALUES (1, '2026-01-01T00:00:00.000Z', 'SUCCESS')",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM sites WHERE id = 1", []).unwrap();

        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM action_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}
