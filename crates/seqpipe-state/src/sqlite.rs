//! `SQLite`-backed implementation of [`JobStatusBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use seqpipe_types::sequence::SequenceOutput;
use seqpipe_types::state::{JobId, RunStatus};

use crate::backend::{JobStatusBackend, RunRecord};
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for status tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job TEXT NOT NULL,
    status TEXT NOT NULL,
    phase TEXT,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS job_phases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES job_runs(id),
    phase TEXT NOT NULL,
    entered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sequence_outputs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES job_runs(id),
    file TEXT NOT NULL,
    label TEXT NOT NULL,
    category TEXT NOT NULL,
    readset_id INTEGER,
    analysis_id INTEGER,
    genome_id INTEGER,
    description TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_sequence_outputs_run ON sequence_outputs (run_id);
";

/// `SQLite`-backed job status storage.
///
/// Create with [`SqliteStatusBackend::open`] for file-backed persistence
/// or [`SqliteStatusBackend::in_memory`] for tests.
pub struct SqliteStatusBackend {
    conn: Mutex<Connection>,
}

impl SqliteStatusBackend {
    /// Open or create a status database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory backend.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the schema can't be created.
    pub fn in_memory() -> error::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Phases a run passed through, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    pub fn phase_history(&self, run_id: i64) -> error::Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT phase FROM job_phases WHERE run_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([run_id], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>().map_err(Into::into)
    }
}

impl JobStatusBackend for SqliteStatusBackend {
    fn start_run(&self, job: &JobId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO job_runs (job, status, started_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![job.as_str(), RunStatus::Running.as_str(), Self::now_sqlite()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn set_phase(&self, run_id: i64, phase: &str) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE job_runs SET phase = ?2 WHERE id = ?1",
            rusqlite::params![run_id, phase],
        )?;
        conn.execute(
            "INSERT INTO job_phases (run_id, phase, entered_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![run_id, phase, Self::now_sqlite()],
        )?;
        Ok(())
    }

    fn request_cancel(&self, run_id: i64) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE job_runs SET status = ?2 WHERE id = ?1 AND status = ?3",
            rusqlite::params![run_id, RunStatus::Cancelling.as_str(), RunStatus::Running.as_str()],
        )?;
        Ok(())
    }

    fn complete_run(&self, run_id: i64, status: RunStatus, error_message: Option<&str>) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE job_runs SET status = ?2, finished_at = ?3, error_message = ?4 WHERE id = ?1",
            rusqlite::params![run_id, status.as_str(), Self::now_sqlite(), error_message],
        )?;
        Ok(())
    }

    fn record_sequence_output(&self, run_id: i64, output: &SequenceOutput) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sequence_outputs \
             (run_id, file, label, category, readset_id, analysis_id, genome_id, description) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                run_id,
                output.file.to_string_lossy().into_owned(),
                output.label,
                output.category,
                output.readset_id,
                output.analysis_id,
                output.genome_id,
                output.description,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> error::Result<Option<RunRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, job, status, phase, error_message FROM job_runs WHERE id = ?1",
                [run_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(id, job, status, phase, error_message)| RunRecord {
            id,
            job,
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            phase,
            error_message,
        }))
    }

    fn sequence_outputs(&self, run_id: i64) -> error::Result<Vec<SequenceOutput>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT file, label, category, readset_id, analysis_id, genome_id, description \
             FROM sequence_outputs WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            Ok(SequenceOutput {
                file: row.get::<_, String>(0)?.into(),
                label: row.get(1)?,
                category: row.get(2)?,
                readset_id: row.get(3)?,
                analysis_id: row.get(4)?,
                genome_id: row.get(5)?,
                description: row.get(6)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
