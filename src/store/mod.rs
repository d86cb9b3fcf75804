//! SQLite persistence for runs, run events, manual actions and applications.
//!
//! All access goes through a single `Mutex<Connection>`. Multi-row changes
//! run inside [`Store::write`], which wraps an IMMEDIATE transaction: the
//! closure either commits as a whole or leaves the database untouched.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Application, ManualAction, ManualActionFilter, NewApplication, NewEvent, Run, RunEvent,
    RunMetrics, RunStatus,
};

/// How long a file database waits for another connection's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idempotent DDL
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    current_node TEXT,
    search_config TEXT NOT NULL,
    state_json TEXT NOT NULL,
    discovered INTEGER NOT NULL DEFAULT 0,
    applied INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    manual_required INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    operator_paused INTEGER NOT NULL DEFAULT 0,
    blocked_by_manual_action TEXT,
    resumed_action_id TEXT,
    node_executions INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status);

CREATE TABLE IF NOT EXISTS run_events (
    run_id TEXT NOT NULL REFERENCES runs(id),
    seq INTEGER NOT NULL,
    level TEXT NOT NULL,
    node TEXT,
    event_type TEXT NOT NULL,
    message TEXT NOT NULL,
    payload_json TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);

CREATE TABLE IF NOT EXISTS manual_actions (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id),
    node TEXT,
    job_id TEXT,
    company TEXT,
    title TEXT,
    action_type TEXT NOT NULL,
    status TEXT NOT NULL,
    details TEXT NOT NULL,
    resolution TEXT,
    session_url TEXT,
    session_started_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_manual_actions_run ON manual_actions (run_id, status);

CREATE TABLE IF NOT EXISTS applications (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id),
    job_id TEXT NOT NULL,
    company TEXT,
    title TEXT,
    status TEXT NOT NULL,
    details TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_applications_run ON applications (run_id);
";

const RUN_COLUMNS: &str = "id, mode, status, current_node, search_config, state_json, \
     discovered, applied, failed, manual_required, skipped, error, operator_paused, \
     blocked_by_manual_action, resumed_action_id, node_executions, \
     created_at, started_at, updated_at, completed_at";

const EVENT_COLUMNS: &str =
    "seq, run_id, level, node, event_type, message, payload_json, created_at";

const ACTION_COLUMNS: &str = "id, run_id, node, job_id, company, title, action_type, status, \
     details, resolution, session_url, session_started_at, created_at, updated_at, resolved_at";

const APPLICATION_COLUMNS: &str =
    "id, run_id, job_id, company, title, status, details, created_at";

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// SQLite-backed store.
///
/// Create with [`Store::open`] for a database file or
/// [`Store::open_in_memory`] for tests.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn)
    }

    /// Create an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run `f` inside a write transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise.
    pub fn write<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let tx = Tx { tx };
        let value = f(&tx)?;
        tx.tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Run `f` against a consistent snapshot
    pub fn read<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction().map_err(StoreError::from)?;
        let value = f(&Tx { tx });
        value
    }

    /// Current time as seen by the database
    pub fn database_time(&self) -> Result<String> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row("SELECT strftime('%Y-%m-%dT%H:%M:%fZ', 'now')", [], |row| {
            row.get(0)
        })?)
    }
}

/// An open transaction with typed accessors
pub struct Tx<'a> {
    tx: Transaction<'a>,
}

impl Tx<'_> {
    // ---- runs ----

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        Ok(self
            .tx
            .query_row(&sql, params![id], run_from_row)
            .optional()?)
    }

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        let sql = format!(
            "INSERT INTO runs ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            RUN_COLUMNS
        );
        self.tx.execute(
            &sql,
            params![
                run.id,
                run.mode.as_str(),
                run.status.as_str(),
                run.current_node,
                serde_json::to_string(&run.search_config)?,
                serde_json::to_string(&run.state_json)?,
                run.metrics.discovered as i64,
                run.metrics.applied as i64,
                run.metrics.failed as i64,
                run.metrics.manual_required as i64,
                run.metrics.skipped as i64,
                run.error,
                run.operator_paused,
                run.blocked_by_manual_action,
                run.resumed_action_id,
                run.node_executions as i64,
                ts(&run.created_at),
                run.started_at.as_ref().map(ts),
                ts(&run.updated_at),
                run.completed_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    /// Persist every mutable column of a run (`search_config` is never rewritten)
    pub fn update_run(&self, run: &Run) -> Result<()> {
        self.tx.execute(
            "UPDATE runs SET status = ?2, current_node = ?3, state_json = ?4, \
             discovered = ?5, applied = ?6, failed = ?7, manual_required = ?8, skipped = ?9, \
             error = ?10, operator_paused = ?11, blocked_by_manual_action = ?12, \
             resumed_action_id = ?13, node_executions = ?14, started_at = ?15, \
             updated_at = ?16, completed_at = ?17 \
             WHERE id = ?1",
            params![
                run.id,
                run.status.as_str(),
                run.current_node,
                serde_json::to_string(&run.state_json)?,
                run.metrics.discovered as i64,
                run.metrics.applied as i64,
                run.metrics.failed as i64,
                run.metrics.manual_required as i64,
                run.metrics.skipped as i64,
                run.error,
                run.operator_paused,
                run.blocked_by_manual_action,
                run.resumed_action_id,
                run.node_executions as i64,
                run.started_at.as_ref().map(ts),
                ts(&run.updated_at),
                run.completed_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    /// Most recently updated runs first
    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs ORDER BY updated_at DESC, created_at DESC LIMIT ?1",
            RUN_COLUMNS
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Ids of runs in any of the given statuses, oldest first
    pub fn run_ids_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut stmt = self
            .tx
            .prepare("SELECT id FROM runs WHERE status = ?1 ORDER BY created_at ASC")?;
        for status in statuses {
            let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;
            for id in rows {
                ids.push(id?);
            }
        }
        Ok(ids)
    }

    // ---- events ----

    /// Append an event under the next per-run sequence number
    pub fn append_event(
        &self,
        run_id: &str,
        event: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<RunEvent> {
        let seq: i64 = self.tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;

        let payload = event
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.tx.execute(
            "INSERT INTO run_events \
             (run_id, seq, level, node, event_type, message, payload_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                seq,
                event.level.as_str(),
                event.node,
                event.event_type,
                event.message,
                payload,
                ts(&now),
            ],
        )?;

        Ok(RunEvent {
            id: seq,
            run_id: run_id.to_string(),
            level: event.level,
            node: event.node.clone(),
            event_type: event.event_type.clone(),
            message: event.message.clone(),
            payload_json: event.payload.clone(),
            created_at: now,
        })
    }

    /// Highest event id of a run (0 when it has none)
    pub fn last_event_id(&self, run_id: &str) -> Result<i64> {
        Ok(self.tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM run_events WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?)
    }

    /// Events with id > `after_id`, ascending, at most `limit`
    pub fn events_after(&self, run_id: &str, after_id: i64, limit: usize) -> Result<Vec<RunEvent>> {
        let sql = format!(
            "SELECT {} FROM run_events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
            EVENT_COLUMNS
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id, after_id, limit as i64], event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- manual actions ----

    pub fn get_action(&self, id: &str) -> Result<Option<ManualAction>> {
        let sql = format!("SELECT {} FROM manual_actions WHERE id = ?1", ACTION_COLUMNS);
        Ok(self
            .tx
            .query_row(&sql, params![id], action_from_row)
            .optional()?)
    }

    pub fn insert_action(&self, action: &ManualAction) -> Result<()> {
        let sql = format!(
            "INSERT INTO manual_actions ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            ACTION_COLUMNS
        );
        self.tx.execute(
            &sql,
            params![
                action.id,
                action.run_id,
                action.node,
                action.job_id,
                action.company,
                action.title,
                action.action_type,
                action.status.as_str(),
                serde_json::to_string(&action.details)?,
                action.resolution.as_ref().map(serde_json::to_string).transpose()?,
                action.session_url,
                action.session_started_at.as_ref().map(ts),
                ts(&action.created_at),
                ts(&action.updated_at),
                action.resolved_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    pub fn update_action(&self, action: &ManualAction) -> Result<()> {
        self.tx.execute(
            "UPDATE manual_actions SET status = ?2, resolution = ?3, session_url = ?4, \
             session_started_at = ?5, updated_at = ?6, resolved_at = ?7 WHERE id = ?1",
            params![
                action.id,
                action.status.as_str(),
                action.resolution.as_ref().map(serde_json::to_string).transpose()?,
                action.session_url,
                action.session_started_at.as_ref().map(ts),
                ts(&action.updated_at),
                action.resolved_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a row was removed
    pub fn delete_action(&self, id: &str) -> Result<bool> {
        let removed = self
            .tx
            .execute("DELETE FROM manual_actions WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Newest first
    pub fn list_actions(&self, filter: &ManualActionFilter, limit: usize) -> Result<Vec<ManualAction>> {
        let sql = format!(
            "SELECT {} FROM manual_actions \
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR run_id = ?2) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?3",
            ACTION_COLUMNS
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.status.map(|s| s.as_str()),
                filter.run_id,
                limit as i64
            ],
            action_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- applications ----

    pub fn insert_application(
        &self,
        run_id: &str,
        app: &NewApplication,
        now: DateTime<Utc>,
    ) -> Result<Application> {
        let application = Application {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            job_id: app.job_id.clone(),
            company: app.company.clone(),
            title: app.title.clone(),
            status: app.status,
            details: app.details.clone(),
            created_at: now,
        };

        let sql = format!(
            "INSERT INTO applications ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            APPLICATION_COLUMNS
        );
        self.tx.execute(
            &sql,
            params![
                application.id,
                application.run_id,
                application.job_id,
                application.company,
                application.title,
                application.status.as_str(),
                serde_json::to_string(&application.details)?,
                ts(&application.created_at),
            ],
        )?;
        Ok(application)
    }

    /// Newest first, optionally restricted to one run
    pub fn list_applications(&self, run_id: Option<&str>, limit: usize) -> Result<Vec<Application>> {
        let sql = format!(
            "SELECT {} FROM applications WHERE (?1 IS NULL OR run_id = ?1) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            APPLICATION_COLUMNS
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id, limit as i64], application_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Current time at the precision timestamps are stored with, so a record
/// returned from a write equals the same record read back later
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

// ---- row mapping ----

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn enum_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}

fn count_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    Ok(raw.max(0) as u64)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        mode: enum_col(row, 1)?,
        status: enum_col(row, 2)?,
        current_node: row.get(3)?,
        search_config: json_col(row, 4)?,
        state_json: json_col(row, 5)?,
        metrics: RunMetrics {
            discovered: count_col(row, 6)?,
            applied: count_col(row, 7)?,
            failed: count_col(row, 8)?,
            manual_required: count_col(row, 9)?,
            skipped: count_col(row, 10)?,
        },
        error: row.get(11)?,
        operator_paused: row.get(12)?,
        blocked_by_manual_action: row.get(13)?,
        resumed_action_id: row.get(14)?,
        node_executions: count_col(row, 15)?,
        created_at: time_col(row, 16)?,
        started_at: opt_time_col(row, 17)?,
        updated_at: time_col(row, 18)?,
        completed_at: opt_time_col(row, 19)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<RunEvent> {
    Ok(RunEvent {
        id: row.get(0)?,
        run_id: row.get(1)?,
        level: enum_col(row, 2)?,
        node: row.get(3)?,
        event_type: row.get(4)?,
        message: row.get(5)?,
        payload_json: opt_json_col(row, 6)?,
        created_at: time_col(row, 7)?,
    })
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<ManualAction> {
    Ok(ManualAction {
        id: row.get(0)?,
        run_id: row.get(1)?,
        node: row.get(2)?,
        job_id: row.get(3)?,
        company: row.get(4)?,
        title: row.get(5)?,
        action_type: row.get(6)?,
        status: enum_col(row, 7)?,
        details: json_col(row, 8)?,
        resolution: opt_json_col(row, 9)?,
        session_url: row.get(10)?,
        session_started_at: opt_time_col(row, 11)?,
        created_at: time_col(row, 12)?,
        updated_at: time_col(row, 13)?,
        resolved_at: opt_time_col(row, 14)?,
    })
}

fn application_from_row(row: &Row<'_>) -> rusqlite::Result<Application> {
    Ok(Application {
        id: row.get(0)?,
        run_id: row.get(1)?,
        job_id: row.get(2)?,
        company: row.get(3)?,
        title: row.get(4)?,
        status: enum_col(row, 5)?,
        details: json_col(row, 6)?,
        created_at: time_col(row, 7)?,
    })
}
