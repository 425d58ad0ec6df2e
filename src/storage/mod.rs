//! SQLite storage for sites and login history.
//!
//! Every mutation runs in a single transaction and its [`DomainEvent`] is
//! published only after `commit()` returned, so subscribers never act on
//! data that could still roll back.
//!
//! Timestamps are stored as RFC 3339 text with millisecond precision, which
//! keeps them ordered under plain string comparison.

pub mod schema;

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::events::{DomainEvent, EventBus};
use crate::model::{
    ActionHistory, ActionStatus, Credentials, FinishHistory, HistoryId, LoginStatus, NewHistory,
    NewSite, Site, SiteId, SiteUpdate,
};
use crate::policy::{PolicyError, PolicyFields, SchedulePolicy};
use crate::script::{Script, SyntaxError};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
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

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("site {0} not found")]
    SiteNotFound(SiteId),

    #[error("history entry {0} not found")]
    HistoryNotFound(HistoryId),

    #[error("history entry {0} is already finished")]
    AlreadyFinished(HistoryId),

    #[error("site {0} is paused")]
    Paused(SiteId),

    #[error("invalid login script: {0}")]
    InvalidScript(#[from] SyntaxError),

    #[error("invalid schedule policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Canonical text form of a stored timestamp.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(col: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

#[derive(Debug, Error)]
#[error("unknown {kind} code {code:?}")]
struct UnknownCode {
    kind: &'static str,
    code: String,
}

const SITE_COLUMNS: &str = "id, name, url, success_url, username, password, take_screenshot, paused,
     custom_script, date_minutes_start, date_minutes_end, allowed_time_minutes_start,
     allowed_time_minutes_end, next_schedule, added_at";

const HISTORY_COLUMNS: &str =
    "id, site_id, execution_started, execution_ended, status, failure, message, screenshot_id";

fn site_from_row(row: &Row) -> rusqlite::Result<Site> {
    let fields = PolicyFields {
        date_minutes_start: row.get(9)?,
        date_minutes_end: row.get(10)?,
        allowed_time_minutes_start: row.get(11)?,
        allowed_time_minutes_end: row.get(12)?,
    };
    let policy = SchedulePolicy::try_from(fields)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Integer, Box::new(e)))?;
    let next_schedule = row
        .get::<_, Option<String>>(13)?
        .map(|raw| parse_ts(13, &raw))
        .transpose()?;

    Ok(Site {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        success_url: row.get(3)?,
        credentials: Credentials::new(row.get::<_, String>(4)?, row.get::<_, String>(5)?),
        take_screenshot: row.get(6)?,
        paused: row.get(7)?,
        custom_script: row.get(8)?,
        policy,
        next_schedule,
        added_at: parse_ts(14, &row.get::<_, String>(14)?)?,
    })
}

fn history_from_row(row: &Row) -> rusqlite::Result<ActionHistory> {
    let code: String = row.get(4)?;
    let status = ActionStatus::parse(&code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            Box::new(UnknownCode {
                kind: "status",
                code: code.clone(),
            }),
        )
    })?;
    let failure = match row.get::<_, Option<String>>(5)? {
        Some(code) => Some(LoginStatus::parse(&code).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                Box::new(UnknownCode {
                    kind: "failure",
                    code: code.clone(),
                }),
            )
        })?),
        None => None,
    };

    Ok(ActionHistory {
        id: row.get(0)?,
        site_id: row.get(1)?,
        execution_started: parse_ts(2, &row.get::<_, String>(2)?)?,
        execution_ended: row
            .get::<_, Option<String>>(3)?
            .map(|raw| parse_ts(3, &raw))
            .transpose()?,
        status,
        failure,
        message: row.get(6)?,
        screenshot_id: row.get(7)?,
    })
}

fn load_site(conn: &Connection, id: SiteId) -> StoreResult<Site> {
    conn.query_row(
        &format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"),
        [id],
        site_from_row,
    )
    .optional()?
    .ok_or(StoreError::SiteNotFound(id))
}

fn load_history(conn: &Connection, id: HistoryId) -> StoreResult<ActionHistory> {
    conn.query_row(
        &format!("SELECT {HISTORY_COLUMNS} FROM action_history WHERE id = ?1"),
        [id],
        history_from_row,
    )
    .optional()?
    .ok_or(StoreError::HistoryNotFound(id))
}

fn validate_script(script: Option<&str>) -> StoreResult<()> {
    if let Some(source) = script {
        Script::parse(source)?;
    }
    Ok(())
}

/// Store the next run drawn from the site's policy, or clear it when paused.
fn redraw_schedule(conn: &Connection, site: &Site) -> StoreResult<Option<DateTime<Utc>>> {
    let next = (!site.paused).then(|| site.policy.next_run());
    conn.execute(
        "UPDATE sites SET next_schedule = ?1 WHERE id = ?2",
        params![next.map(format_ts), site.id],
    )?;
    Ok(next)
}

fn write_finish(conn: &Connection, id: HistoryId, finish: &FinishHistory) -> StoreResult<ActionHistory> {
    let current = load_history(conn, id)?;
    if current.status.is_terminal() {
        return Err(StoreError::AlreadyFinished(id));
    }
    conn.execute(
        "UPDATE action_history
         SET execution_ended = ?1, status = ?2, failure = ?3, message = ?4,
             screenshot_id = COALESCE(?5, screenshot_id)
         WHERE id = ?6",
        params![
            format_ts(Utc::now()),
            finish.status.as_str(),
            finish.failure.map(|f| f.as_str()),
            finish.message,
            finish.screenshot_id,
            id,
        ],
    )?;
    let site = load_site(conn, current.site_id)?;
    redraw_schedule(conn, &site)?;
    load_history(conn, id)
}

/// Site and history persistence with post-commit event publication.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    events: EventBus,
}

impl Store {
    pub fn new(pool: Pool, events: EventBus) -> Self {
        Self { pool, events }
    }

    pub fn open(path: &Path, events: EventBus) -> Result<Self> {
        Ok(Self::new(open_pool(path)?, events))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Sites
    // -----------------------------------------------------------------------

    pub fn add_site(&self, new: NewSite) -> StoreResult<Site> {
        validate_script(new.custom_script.as_deref())?;
        // A new site logs in straight away so bad credentials show up early.
        let next = (!new.paused).then(Utc::now);
        let fields = new.policy.fields();

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sites (name, url, success_url, username, password, take_screenshot, paused,
                 custom_script, date_minutes_start, date_minutes_end, allowed_time_minutes_start,
                 allowed_time_minutes_end, next_schedule, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                new.name,
                new.url,
                new.success_url,
                new.credentials.username,
                new.credentials.password,
                new.take_screenshot,
                new.paused,
                new.custom_script,
                fields.date_minutes_start,
                fields.date_minutes_end,
                fields.allowed_time_minutes_start,
                fields.allowed_time_minutes_end,
                next.map(format_ts),
                format_ts(Utc::now()),
            ],
        )?;
        let site = load_site(&tx, tx.last_insert_rowid())?;
        tx.commit()?;

        info!(site_id = site.id, name = %site.name, "site added");
        self.events.publish(DomainEvent::SiteCreated { site_id: site.id });
        Ok(site)
    }

    pub fn get_site(&self, id: SiteId) -> StoreResult<Site> {
        let conn = self.pool.get()?;
        load_site(&conn, id)
    }

    pub fn list_sites(&self) -> StoreResult<Vec<Site>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {SITE_COLUMNS} FROM sites ORDER BY id"))?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    /// Apply a partial edit. A changed policy draws a new next run.
    pub fn update_site(&self, id: SiteId, update: SiteUpdate) -> StoreResult<Site> {
        if let Some(script) = &update.custom_script {
            validate_script(script.as_deref())?;
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut site = load_site(&tx, id)?;

        if let Some(name) = update.name {
            site.name = name;
        }
        if let Some(url) = update.url {
            site.url = url;
        }
        if let Some(success_url) = update.success_url {
            site.success_url = success_url;
        }
        if let Some(credentials) = update.credentials {
            site.credentials = credentials;
        }
        if let Some(take_screenshot) = update.take_screenshot {
            site.take_screenshot = take_screenshot;
        }
        if let Some(script) = update.custom_script {
            site.custom_script = script;
        }
        let rescheduled = update.policy.is_some_and(|p| p != site.policy) && !site.paused;
        if let Some(policy) = update.policy {
            site.policy = policy;
        }

        let fields = site.policy.fields();
        tx.execute(
            "UPDATE sites SET name = ?1, url = ?2, success_url = ?3, username = ?4, password = ?5,
                 take_screenshot = ?6, custom_script = ?7, date_minutes_start = ?8,
                 date_minutes_end = ?9, allowed_time_minutes_start = ?10,
                 allowed_time_minutes_end = ?11
             WHERE id = ?12",
            params![
                site.name,
                site.url,
                site.success_url,
                site.credentials.username,
                site.credentials.password,
                site.take_screenshot,
                site.custom_script,
                fields.date_minutes_start,
                fields.date_minutes_end,
                fields.allowed_time_minutes_start,
                fields.allowed_time_minutes_end,
                id,
            ],
        )?;
        if rescheduled {
            site.next_schedule = redraw_schedule(&tx, &site)?;
        }
        tx.commit()?;

        debug!(site_id = id, rescheduled, "site updated");
        if rescheduled {
            self.events.publish(DomainEvent::SiteRescheduled { site_id: id });
        }
        Ok(site)
    }

    /// Pausing clears the next run; resuming draws a fresh one.
    pub fn set_paused(&self, id: SiteId, paused: bool) -> StoreResult<Site> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut site = load_site(&tx, id)?;
        if site.paused == paused {
            return Ok(site);
        }
        tx.execute("UPDATE sites SET paused = ?1 WHERE id = ?2", params![paused, id])?;
        site.paused = paused;
        site.next_schedule = redraw_schedule(&tx, &site)?;
        tx.commit()?;

        info!(site_id = id, paused, "site pause state changed");
        self.events.publish(DomainEvent::SitePaused { site_id: id, paused });
        Ok(site)
    }

    /// Schedule an immediate login attempt.
    pub fn trigger_now(&self, id: SiteId) -> StoreResult<Site> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut site = load_site(&tx, id)?;
        if site.paused {
            return Err(StoreError::Paused(id));
        }
        let now = Utc::now();
        tx.execute(
            "UPDATE sites SET next_schedule = ?1 WHERE id = ?2",
            params![format_ts(now), id],
        )?;
        site.next_schedule = Some(now);
        tx.commit()?;

        info!(site_id = id, "immediate login requested");
        self.events.publish(DomainEvent::SiteRescheduled { site_id: id });
        Ok(site)
    }

    /// Replace the next run with a freshly drawn one.
    pub fn reschedule(&self, id: SiteId) -> StoreResult<Site> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut site = load_site(&tx, id)?;
        site.next_schedule = redraw_schedule(&tx, &site)?;
        tx.commit()?;

        if !site.paused {
            self.events.publish(DomainEvent::SiteRescheduled { site_id: id });
        }
        Ok(site)
    }

    pub fn delete_site(&self, id: SiteId) -> StoreResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let changed = tx.execute("DELETE FROM sites WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(StoreError::SiteNotFound(id));
        }
        tx.commit()?;

        info!(site_id = id, "site deleted");
        self.events.publish(DomainEvent::SiteDeleted { site_id: id });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Insert a history row; the site's next run is redrawn unless paused.
    pub fn insert_history(&self, site_id: SiteId, entry: NewHistory) -> StoreResult<ActionHistory> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let site = load_site(&tx, site_id)?;
        tx.execute(
            "INSERT INTO action_history
                 (site_id, execution_started, execution_ended, status, failure, message, screenshot_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                site_id,
                format_ts(entry.execution_started),
                entry.execution_ended.map(format_ts),
                entry.status.as_str(),
                entry.failure.map(|f| f.as_str()),
                entry.message,
                entry.screenshot_id,
            ],
        )?;
        let history = load_history(&tx, tx.last_insert_rowid())?;
        redraw_schedule(&tx, &site)?;
        tx.commit()?;

        debug!(site_id, history_id = history.id, status = %history.status, "history logged");
        self.events.publish(DomainEvent::HistoryLogged {
            site_id,
            history_id: history.id,
        });
        Ok(history)
    }

    /// Write the terminal state onto an in-progress row.
    pub fn finish_history(&self, id: HistoryId, finish: FinishHistory) -> StoreResult<ActionHistory> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let history = write_finish(&tx, id, &finish)?;
        tx.commit()?;

        debug!(site_id = history.site_id, history_id = id, status = %history.status, "history finished");
        self.events.publish(DomainEvent::HistoryChanged {
            site_id: history.site_id,
            history_id: id,
        });
        Ok(history)
    }

    /// Fail the in-progress row of the attempt that started at `started`.
    /// Returns `None` when no such row exists.
    pub fn fail_in_progress(
        &self,
        site_id: SiteId,
        started: DateTime<Utc>,
        message: Option<String>,
    ) -> StoreResult<Option<ActionHistory>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let id: Option<HistoryId> = tx
            .query_row(
                "SELECT id FROM action_history
                 WHERE site_id = ?1 AND execution_started = ?2 AND status = ?3
                 ORDER BY id LIMIT 1",
                params![site_id, format_ts(started), ActionStatus::InProgress.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };
        let finish = FinishHistory::from_outcome(LoginStatus::UnknownExecutionError, message, None);
        let history = write_finish(&tx, id, &finish)?;
        tx.commit()?;

        self.events.publish(DomainEvent::HistoryChanged {
            site_id,
            history_id: id,
        });
        Ok(Some(history))
    }

    /// Fail every row still in progress. Run once at startup, before any
    /// attempt can be in flight.
    pub fn fail_stale_in_progress(&self, message: &str) -> StoreResult<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let stale: Vec<(HistoryId, SiteId)> = {
            let mut stmt = tx.prepare("SELECT id, site_id FROM action_history WHERE status = ?1")?;
            let rows = stmt.query_map([ActionStatus::InProgress.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        tx.execute(
            "UPDATE action_history
             SET execution_ended = ?1, status = ?2, failure = ?3, message = ?4
             WHERE status = ?5",
            params![
                format_ts(Utc::now()),
                ActionStatus::Failed.as_str(),
                LoginStatus::UnknownExecutionError.as_str(),
                message,
                ActionStatus::InProgress.as_str(),
            ],
        )?;
        tx.commit()?;

        for (history_id, site_id) in &stale {
            self.events.publish(DomainEvent::HistoryChanged {
                site_id: *site_id,
                history_id: *history_id,
            });
        }
        Ok(stale.len())
    }

    pub fn get_history(&self, id: HistoryId) -> StoreResult<ActionHistory> {
        let conn = self.pool.get()?;
        load_history(&conn, id)
    }

    /// Most recent attempts first.
    pub fn history_for_site(&self, site_id: SiteId, limit: usize) -> StoreResult<Vec<ActionHistory>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM action_history
             WHERE site_id = ?1 ORDER BY execution_started DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![site_id, limit as i64], history_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.db"), EventBus::default()).unwrap();
        (dir, store)
    }

    fn new_site(paused: bool) -> NewSite {
        NewSite {
            name: "forum".into(),
            url: "https://forum.example/login".into(),
            success_url: "https://forum.example/".into(),
            credentials: Credentials::new("alice", "hunter2"),
            take_screenshot: false,
            paused,
            custom_script: None,
            policy: SchedulePolicy::every_days(7),
        }
    }

    #[test]
    fn test_add_site_schedules_and_announces_after_commit() {
        let (_dir, store) = store();
        let mut rx = store.events().subscribe();

        let before = Utc::now();
        let site = store.add_site(new_site(false)).unwrap();
        let first = site.next_schedule.unwrap();
        assert!(first >= before - Duration::milliseconds(1));
        assert!(first <= Utc::now());
        assert_eq!(rx.try_recv().unwrap(), DomainEvent::SiteCreated { site_id: site.id });

        let loaded = store.get_site(site.id).unwrap();
        assert_eq!(loaded.credentials.password, "hunter2");
        assert_eq!(loaded.policy, SchedulePolicy::every_days(7));
    }

    #[test]
    fn test_paused_site_has_no_next_run() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(true)).unwrap();
        assert_eq!(site.next_schedule, None);

        let resumed = store.set_paused(site.id, false).unwrap();
        assert!(resumed.next_schedule.is_some());
        let paused = store.set_paused(site.id, true).unwrap();
        assert_eq!(paused.next_schedule, None);
        assert_eq!(store.get_site(site.id).unwrap().next_schedule, None);
    }

    #[test]
    fn test_set_paused_is_silent_when_unchanged() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(false)).unwrap();
        let mut rx = store.events().subscribe();
        store.set_paused(site.id, false).unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_invalid_script_is_rejected() {
        let (_dir, store) = store();
        let mut bad = new_site(false);
        bad.custom_script = Some("fillUsername(".into());
        assert!(matches!(store.add_site(bad), Err(StoreError::InvalidScript(_))));

        let site = store.add_site(new_site(false)).unwrap();
        let update = SiteUpdate {
            custom_script: Some(Some("wait('x')".into())),
            ..Default::default()
        };
        assert!(matches!(store.update_site(site.id, update), Err(StoreError::InvalidScript(_))));
    }

    #[test]
    fn test_policy_change_reschedules() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(false)).unwrap();
        let mut rx = store.events().subscribe();

        let renamed = store
            .update_site(site.id, SiteUpdate { name: Some("board".into()), ..Default::default() })
            .unwrap();
        assert_eq!(renamed.name, "board");
        assert_eq!(renamed.next_schedule, site.next_schedule);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let update = SiteUpdate {
            policy: Some(SchedulePolicy::every_days(1)),
            custom_script: Some(Some("fillUsername()".into())),
            ..Default::default()
        };
        let updated = store.update_site(site.id, update).unwrap();
        assert_eq!(updated.custom_script.as_deref(), Some("fillUsername()"));
        assert!(updated.next_schedule.unwrap() <= Utc::now() + Duration::days(3));
        assert_eq!(rx.try_recv().unwrap(), DomainEvent::SiteRescheduled { site_id: site.id });
    }

    #[test]
    fn test_trigger_now() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(false)).unwrap();
        let before = Utc::now() - Duration::seconds(1);
        let triggered = store.trigger_now(site.id).unwrap();
        assert!(triggered.next_schedule.unwrap() >= before);
        assert!(triggered.next_schedule.unwrap() <= Utc::now());

        store.set_paused(site.id, true).unwrap();
        assert!(matches!(store.trigger_now(site.id), Err(StoreError::Paused(_))));
    }

    #[test]
    fn test_history_lifecycle_redraws_schedule() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(false)).unwrap();
        store.trigger_now(site.id).unwrap();
        let mut rx = store.events().subscribe();

        let started = Utc::now();
        let row = store
            .insert_history(site.id, NewHistory::in_progress(started, Some("shot".into())))
            .unwrap();
        assert_eq!(row.status, ActionStatus::InProgress);
        assert_eq!(
            rx.try_recv().unwrap(),
            DomainEvent::HistoryLogged { site_id: site.id, history_id: row.id }
        );
        let after_insert = store.get_site(site.id).unwrap().next_schedule.unwrap();
        assert!(after_insert > Utc::now() + Duration::days(5));

        let finish = FinishHistory::from_outcome(LoginStatus::PasswordFieldNotFound, None, None);
        let done = store.finish_history(row.id, finish.clone()).unwrap();
        assert_eq!(done.status, ActionStatus::Failed);
        assert_eq!(done.failure, Some(LoginStatus::PasswordFieldNotFound));
        assert_eq!(done.screenshot_id.as_deref(), Some("shot"));
        assert!(done.execution_ended.is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            DomainEvent::HistoryChanged { site_id: site.id, history_id: row.id }
        );

        assert!(matches!(
            store.finish_history(row.id, finish),
            Err(StoreError::AlreadyFinished(_))
        ));
    }

    #[test]
    fn test_manual_entry_redraws_schedule() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(false)).unwrap();
        let mut rx = store.events().subscribe();

        let row = store.insert_history(site.id, NewHistory::manual(Utc::now())).unwrap();
        assert_eq!(row.status, ActionStatus::Success);
        assert_eq!(row.execution_started, row.execution_ended.unwrap());
        assert_eq!(row.message.as_deref(), Some(crate::model::MANUAL_LOGIN));
        assert_eq!(
            rx.try_recv().unwrap(),
            DomainEvent::HistoryLogged { site_id: site.id, history_id: row.id }
        );
        let next = store.get_site(site.id).unwrap().next_schedule.unwrap();
        assert!(next > Utc::now() + Duration::days(5));
    }

    #[test]
    fn test_fail_in_progress_matches_start_time() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(false)).unwrap();
        let started = Utc::now();
        let row = store
            .insert_history(site.id, NewHistory::in_progress(started, None))
            .unwrap();

        let other = started - Duration::minutes(5);
        assert!(store.fail_in_progress(site.id, other, None).unwrap().is_none());

        let failed = store
            .fail_in_progress(site.id, started, Some("worker died".into()))
            .unwrap()
            .unwrap();
        assert_eq!(failed.id, row.id);
        assert_eq!(failed.status, ActionStatus::Failed);
        assert_eq!(failed.failure, Some(LoginStatus::UnknownExecutionError));
        assert_eq!(store.history_for_site(site.id, 10).unwrap().len(), 1);

        assert!(store.fail_in_progress(site.id, started, None).unwrap().is_none());
    }

    #[test]
    fn test_fail_stale_in_progress() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(false)).unwrap();
        let now = Utc::now();
        store.insert_history(site.id, NewHistory::in_progress(now, None)).unwrap();
        store
            .insert_history(site.id, NewHistory::crashed(now, now, None))
            .unwrap();

        assert_eq!(store.fail_stale_in_progress("interrupted").unwrap(), 1);
        let rows = store.history_for_site(site.id, 10).unwrap();
        assert!(rows.iter().all(|h| h.status == ActionStatus::Failed));
        assert_eq!(store.fail_stale_in_progress("interrupted").unwrap(), 0);
    }

    #[test]
    fn test_history_is_newest_first_and_limited() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(false)).unwrap();
        let base = Utc::now() - Duration::days(3);
        for day in 0..3 {
            let at = base + Duration::days(day);
            store.insert_history(site.id, NewHistory::crashed(at, at, None)).unwrap();
        }
        let rows = store.history_for_site(site.id, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].execution_started > rows[1].execution_started);
    }

    #[test]
    fn test_delete_site_cascades() {
        let (_dir, store) = store();
        let site = store.add_site(new_site(false)).unwrap();
        let now = Utc::now();
        let row = store.insert_history(site.id, NewHistory::crashed(now, now, None)).unwrap();

        store.delete_site(site.id).unwrap();
        assert!(matches!(store.get_site(site.id), Err(StoreError::SiteNotFound(_))));
        assert!(matches!(store.get_history(row.id), Err(StoreError::HistoryNotFound(_))));
        assert!(matches!(store.delete_site(site.id), Err(StoreError::SiteNotFound(_))));
    }

    #[test]
    fn test_history_for_unknown_site_fails() {
        let (_dir, store) = store();
        let now = Utc::now();
        assert!(matches!(
            store.insert_history(42, NewHistory::crashed(now, now, None)),
            Err(StoreError::SiteNotFound(42))
        ));
    }
}
