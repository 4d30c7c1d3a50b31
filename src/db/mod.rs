use crate::errors::{AppError, AppResult};
use crate::models::{ListRunsFilters, RunEventRecord, RunRecord, RunStatus};
use crate::parameters::ParameterValue;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// SQLite ledger of runs, their events and saved parameter defaults.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// Fields recorded when a run is queued.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub run_id: &'a str,
    pub class: &'a str,
    pub file_name: Option<&'a str>,
    pub results_path: &'a Path,
    pub output_path: Option<&'a Path>,
    pub parameters: &'a BTreeMap<String, ParameterValue>,
    pub status: RunStatus,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn insert_run(&self, run: &NewRun<'_>) -> AppResult<RunRecord> {
        let now = Utc::now();
        let parameters = serde_json::to_value(run.parameters)?;
        let results_path = run.results_path.display().to_string();
        let output_path = run.output_path.map(|path| path.display().to_string());
        let ended_at = run.status.is_terminal().then_some(now);

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (
               id, class, status, file_name, results_path, output_path, parameters_json, queued_at, ended_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.run_id,
                run.class,
                run.status.as_str(),
                run.file_name,
                results_path,
                output_path,
                serde_json::to_string(&parameters)?,
                now.to_rfc3339(),
                ended_at.map(|at| at.to_rfc3339()),
            ],
        )?;

        Ok(RunRecord {
            id: run.run_id.to_string(),
            class: run.class.to_string(),
            status: run.status,
            file_name: run.file_name.map(ToString::to_string),
            results_path,
            output_path,
            parameters,
            queued_at: now,
            started_at: None,
            ended_at,
            error_summary: None,
        })
    }

    /// Records a status transition. `running` stamps `started_at`; terminal
    /// states stamp `ended_at`.
    pub fn update_run_status(&self, run_id: &str, status: RunStatus, error_summary: Option<&str>) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let changed = match status {
            RunStatus::Running => conn.execute(
                "UPDATE runs SET status = ?1, started_at = ?2, error_summary = ?3 WHERE id = ?4",
                params![status.as_str(), now, error_summary, run_id],
            )?,
            status if status.is_terminal() => conn.execute(
                "UPDATE runs SET status = ?1, ended_at = ?2, error_summary = ?3 WHERE id = ?4",
                params![status.as_str(), now, error_summary, run_id],
            )?,
            _ => conn.execute(
                "UPDATE runs SET status = ?1, error_summary = ?2 WHERE id = ?3",
                params![status.as_str(), error_summary, run_id],
            )?,
        };
        if changed == 0 {
            return Err(AppError::NotFound(format!("run {run_id}")));
        }
        Ok(())
    }

    pub fn insert_event(&self, run_id: &str, event_type: &str, payload: &serde_json::Value) -> AppResult<RunEventRecord> {
        let created_at = Utc::now();
        let id = Uuid::new_v4().to_string();

        let conn = self.lock()?;
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO run_events (id, run_id, seq, event_type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                run_id,
                seq,
                event_type,
                serde_json::to_string(payload)?,
                created_at.to_rfc3339()
            ],
        )?;

        Ok(RunEventRecord {
            id,
            run_id: run_id.to_string(),
            seq,
            event_type: event_type.to_string(),
            payload: payload.clone(),
            created_at,
        })
    }

    pub fn get_run(&self, run_id: &str) -> AppResult<Option<RunRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, class, status, file_name, results_path, output_path, parameters_json, queued_at, started_at, ended_at, error_summary
             FROM runs WHERE id = ?1",
            [run_id],
            parse_run_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_runs(&self, filters: &ListRunsFilters) -> AppResult<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut query = String::from(
            "SELECT id, class, status, file_name, results_path, output_path, parameters_json, queued_at, started_at, ended_at, error_summary
             FROM runs WHERE 1 = 1",
        );

        let mut params_vec: Vec<String> = Vec::new();
        if let Some(status) = filters.status {
            query.push_str(" AND status = ?");
            params_vec.push(status.as_str().to_string());
        }
        if let Some(class) = &filters.class {
            query.push_str(" AND class = ?");
            params_vec.push(class.clone());
        }
        query.push_str(" ORDER BY queued_at ASC, rowid ASC LIMIT ? OFFSET ?");

        let limit = filters.limit.unwrap_or(100);
        let offset = filters.offset.unwrap_or(0);
        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);
        dyn_params.push(&offset);

        let rows = statement.query_map(rusqlite::params_from_iter(dyn_params), parse_run_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn list_events(&self, run_id: &str) -> AppResult<Vec<RunEventRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, run_id, seq, event_type, payload_json, created_at
             FROM run_events WHERE run_id = ?1 ORDER BY seq ASC",
        )?;
        let events = statement
            .query_map([run_id], |row| {
                Ok(RunEventRecord {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    seq: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: serde_json::from_str::<serde_json::Value>(&row.get::<_, String>(4)?)
                        .unwrap_or(serde_json::json!({})),
                    created_at: parse_time(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn delete_run(&self, run_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM run_events WHERE run_id = ?1", [run_id])?;
        conn.execute("DELETE FROM runs WHERE id = ?1", [run_id])?;
        Ok(())
    }

    /// Runs left queued or running by a previous process can never finish.
    pub fn mark_orphan_runs_failed(&self) -> AppResult<u64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE runs
             SET status = 'failed', ended_at = ?1, error_summary = 'Process restarted during run'
             WHERE status IN ('queued', 'running')",
            [now],
        )?;
        Ok(changed as u64)
    }

    pub fn save_defaults(&self, class: &str, values: &BTreeMap<String, ParameterValue>) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO procedure_defaults (class, parameters_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(class) DO UPDATE SET parameters_json = excluded.parameters_json, updated_at = excluded.updated_at",
            params![class, serde_json::to_string(values)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_defaults(&self, class: &str) -> AppResult<Option<BTreeMap<String, ParameterValue>>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT parameters_json FROM procedure_defaults WHERE class = ?1",
                [class],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(AppError::from))
            .transpose()
    }
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let parameters_raw: String = row.get(6)?;
    Ok(RunRecord {
        id: row.get(0)?,
        class: row.get(1)?,
        status: parse_status(&row.get::<_, String>(2)?)?,
        file_name: row.get(3)?,
        results_path: row.get(4)?,
        output_path: row.get(5)?,
        parameters: serde_json::from_str(&parameters_raw).unwrap_or(serde_json::json!({})),
        queued_at: parse_time(&row.get::<_, String>(7)?)?,
        started_at: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        ended_at: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        error_summary: row.get(10)?,
    })
}

fn parse_status(raw: &str) -> rusqlite::Result<RunStatus> {
    match raw {
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "finished" => Ok(RunStatus::Finished),
        "aborted" => Ok(RunStatus::Aborted),
        _ => Ok(RunStatus::Failed),
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
