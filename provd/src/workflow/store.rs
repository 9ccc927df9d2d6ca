//! Workflow-runner persistence.
//!
//! Runs and per-step outputs live in their own sqlite file, separate from
//! the domain store: the runner is generic machinery and its tables are not
//! part of the domain schema contract.

use std::path::Path;

use rusqlite::{OptionalExtension, params};

use provd_shared::errors::{ProvdError, ProvdResult};

use crate::store::Database;

use super::types::RunStatus;

const RUNS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id     TEXT PRIMARY KEY,
    kind       TEXT NOT NULL,
    status     TEXT NOT NULL,
    version    INTEGER NOT NULL DEFAULT 1,
    request    TEXT NOT NULL,
    error      TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS run_steps (
    run_id       TEXT NOT NULL,
    step         TEXT NOT NULL,
    output       TEXT NOT NULL,
    completed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (run_id, step)
);
"#;

/// A persisted run row.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub kind: String,
    pub status: RunStatus,
    pub version: i64,
    pub request: String,
    pub error: Option<String>,
}

/// Run persistence wrapping [`Database`].
#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn open(path: &Path) -> ProvdResult<Self> {
        Ok(Self {
            db: Database::open(path, RUNS_SCHEMA)?,
        })
    }

    pub fn open_in_memory() -> ProvdResult<Self> {
        Ok(Self {
            db: Database::open_in_memory(RUNS_SCHEMA)?,
        })
    }

    /// Insert a fresh run at version 1. Duplicate run ids are rejected.
    pub fn insert_run(&self, run_id: &str, kind: &str, request: &str) -> ProvdResult<i64> {
        let conn = self.db.conn();
        let inserted = conn.execute(
            r#"
            INSERT INTO runs (run_id, kind, status, request)
            VALUES (?1, ?2, 'pending', ?3)
            ON CONFLICT(run_id) DO NOTHING
            "#,
            params![run_id, kind, request],
        )?;
        if inserted == 0 {
            return Err(ProvdError::Workflow(format!("duplicate run id {}", run_id)));
        }
        Ok(1)
    }

    pub fn get_run(&self, run_id: &str) -> ProvdResult<Option<RunRow>> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                "SELECT run_id, kind, status, version, request, error FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(run_id, kind, status, version, request, error)| -> ProvdResult<RunRow> {
                let status = RunStatus::parse(&status).ok_or_else(|| {
                    ProvdError::Workflow(format!("run {} has unknown status {}", run_id, status))
                })?;
                Ok(RunRow {
                    run_id,
                    kind,
                    status,
                    version,
                    request,
                    error,
                })
            },
        )
        .transpose()
    }

    /// Every run whose state is in-flight, oldest first.
    pub fn unfinished_runs(&self) -> ProvdResult<Vec<RunRow>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, kind, status, version, request, error
            FROM runs
            WHERE status IN ('pending', 'running')
            ORDER BY created_at ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, kind, status, version, request, error) = row?;
            let status = RunStatus::parse(&status).ok_or_else(|| {
                ProvdError::Workflow(format!("run {} has unknown status {}", run_id, status))
            })?;
            runs.push(RunRow {
                run_id,
                kind,
                status,
                version,
                request,
                error,
            });
        }
        Ok(runs)
    }

    pub fn set_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> ProvdResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE runs SET status = ?1, error = ?2 WHERE run_id = ?3",
            params![status.as_str(), error, run_id],
        )?;
        Ok(())
    }

    /// Bump a run's version for a resume pass; returns the new version.
    pub fn bump_version(&self, run_id: &str) -> ProvdResult<i64> {
        let conn = self.db.conn();
        let version: i64 = conn.query_row(
            "UPDATE runs SET version = version + 1 WHERE run_id = ?1 RETURNING version",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Persisted output of a completed step, if any.
    pub fn step_output(&self, run_id: &str, step: &str) -> ProvdResult<Option<String>> {
        let conn = self.db.conn();
        let output = conn
            .query_row(
                "SELECT output FROM run_steps WHERE run_id = ?1 AND step = ?2",
                params![run_id, step],
                |row| row.get(0),
            )
            .optional()?;
        Ok(output)
    }

    /// Durably record a step's output. Re-recording after a resume replay
    /// overwrites the previous output.
    pub fn record_step(&self, run_id: &str, step: &str, output: &str) -> ProvdResult<()> {
        let conn = self.db.conn();
        conn.execute(
            r#"
            INSERT INTO run_steps (run_id, step, output)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(run_id, step) DO UPDATE SET
                output       = excluded.output,
                completed_at = CURRENT_TIMESTAMP
            "#,
            params![run_id, step, output],
        )?;
        Ok(())
    }
}
