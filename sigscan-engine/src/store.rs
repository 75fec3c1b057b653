//! SQLite persistence for resume slots and run history.
//!
//! Two tables:
//! - `scan_resume_state`: one row per job type, overwritten on every stop and deleted on a
//!   clean finish.
//! - `scan_run_metrics`: append-only history keyed by a unique run id, pruned by age.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::job::JobKind;
use crate::metrics::RunMetricsSnapshot;
use crate::resume::ResumeState;
use crate::summary::RunStatus;

/// SQLite store shared by every job's `ScanState` and metrics tracker.
pub struct ScanStore {
    conn: Mutex<Connection>,
}

impl ScanStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!(path = ?path, "Scan store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        debug!("In-memory scan store created");
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("scan store connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scan_resume_state (
                job_type TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scan_run_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                run_type TEXT NOT NULL,
                status TEXT NOT NULL,
                metrics_json TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_run_metrics_type ON scan_run_metrics(run_type);
            CREATE INDEX IF NOT EXISTS idx_run_metrics_finished ON scan_run_metrics(finished_at);
            "#,
        )?;

        debug!("Scan store schema initialized");
        Ok(())
    }

    // ========================================================================
    // Resume slots
    // ========================================================================

    /// Raw stored snapshot for `kind`. Shape normalization is left to the caller.
    pub fn load_resume_state(&self, kind: JobKind) -> Result<Option<Value>> {
        let conn = self.conn()?;

        let raw: Option<String> = conn
            .query_row(
                "SELECT state_json FROM scan_resume_state WHERE job_type = ?1",
                params![kind.name()],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(job = %kind, error = %e, "Stored resume snapshot is not valid JSON");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Overwrite the slot for the snapshot's job type.
    pub fn save_resume_state(&self, state: &ResumeState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO scan_resume_state (job_type, state_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(job_type) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
            params![state.kind().name(), json, Utc::now().to_rfc3339()],
        )?;

        debug!(job = %state.kind(), next_index = state.cursor().next_index, "Resume state saved");
        Ok(())
    }

    pub fn clear_resume_state(&self, kind: JobKind) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM scan_resume_state WHERE job_type = ?1",
            params![kind.name()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Run history
    // ========================================================================

    /// Append one snapshot. Returns false when the run id was already recorded.
    pub fn append_run_metrics(&self, snapshot: &RunMetricsSnapshot) -> Result<bool> {
        let metrics_json = serde_json::to_string(&snapshot.metrics)?;
        let conn = self.conn()?;

        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO scan_run_metrics
                (run_id, run_type, status, metrics_json, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                snapshot.run_id,
                snapshot.run_type.name(),
                snapshot.status.as_str(),
                metrics_json,
                snapshot.started_at.to_rfc3339(),
                snapshot.finished_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            warn!(run_id = %snapshot.run_id, "Run metrics already recorded, ignoring duplicate");
        }
        Ok(inserted > 0)
    }

    /// Most recent snapshots first, optionally filtered by job type.
    pub fn recent_run_metrics(
        &self,
        kind: Option<JobKind>,
        limit: usize,
    ) -> Result<Vec<RunMetricsSnapshot>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, run_type, status, metrics_json, started_at, finished_at
            FROM scan_run_metrics
            WHERE ?1 IS NULL OR run_type = ?1
            ORDER BY finished_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt
            .query_map(params![kind.map(|k| k.name()), limit as i64], row_to_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows.into_iter().flatten().collect())
    }

    pub fn get_run_metrics(&self, run_id: &str) -> Result<Option<RunMetricsSnapshot>> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                r#"
                SELECT run_id, run_type, status, metrics_json, started_at, finished_at
                FROM scan_run_metrics
                WHERE run_id = ?1
                "#,
                params![run_id],
                row_to_snapshot,
            )
            .optional()?;

        Ok(row.flatten())
    }

    /// Delete history older than `older_than_days`. Returns the number of rows removed.
    pub fn prune_run_metrics(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        let conn = self.conn()?;

        let removed = conn.execute(
            "DELETE FROM scan_run_metrics WHERE finished_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        if removed > 0 {
            info!(removed, older_than_days, "Pruned run metrics history");
        }
        Ok(removed)
    }
}

/// Rows with an unknown job type or status are skipped rather than failing the query.
fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<Option<RunMetricsSnapshot>> {
    let run_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let metrics_json: String = row.get(3)?;
    let started: String = row.get(4)?;
    let finished: String = row.get(5)?;

    let (Ok(run_type), Some(status)) = (
        run_type.parse::<JobKind>(),
        RunStatus::from_db_string(&status),
    ) else {
        return Ok(None);
    };

    Ok(Some(RunMetricsSnapshot {
        run_id: row.get(0)?,
        run_type,
        status,
        metrics: serde_json::from_str(&metrics_json).unwrap_or(Value::Null),
        started_at: parse_timestamp(&started),
        finished_at: parse_timestamp(&finished),
    }))
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
