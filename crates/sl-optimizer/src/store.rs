use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sl_types::{StudyError, StudyResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::search::Params;
use crate::trial::{ObjectiveDirection, TrialRecord, TrialState};

/// SQLite-backed persistence for studies and their trials.
#[derive(Debug)]
pub struct StudyStore {
    connection: Connection,
    path: PathBuf,
}

fn storage_err(e: impl std::fmt::Display) -> StudyError {
    StudyError::Storage {
        message: e.to_string(),
    }
}

fn parse_time(value: &str) -> StudyResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(storage_err)
}

impl StudyStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StudyResult<Self> {
        let path = path.as_ref().to_path_buf();
        let connection = Connection::open(&path).map_err(storage_err)?;

        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS studies (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    direction TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS trials (
                    study_id INTEGER NOT NULL,
                    number INTEGER NOT NULL,
                    state TEXT NOT NULL,
                    params TEXT NOT NULL,
                    value REAL,
                    created_at TEXT NOT NULL,
                    finished_at TEXT,
                    PRIMARY KEY (study_id, number)
                );

                CREATE TABLE IF NOT EXISTS intermediate_values (
                    study_id INTEGER NOT NULL,
                    number INTEGER NOT NULL,
                    step INTEGER NOT NULL,
                    value REAL NOT NULL,
                    PRIMARY KEY (study_id, number, step)
                );",
            )
            .map_err(storage_err)?;

        Ok(Self { connection, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a study by name, creating it if needed. Returns its id and the
    /// stored direction, which wins over `direction` for existing studies.
    pub fn ensure_study(
        &self,
        name: &str,
        direction: ObjectiveDirection,
    ) -> StudyResult<(i64, ObjectiveDirection)> {
        let existing: Option<(i64, String)> = self
            .connection
            .query_row(
                "SELECT id, direction FROM studies WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage_err)?;

        if let Some((id, stored)) = existing {
            let stored = match stored.as_str() {
                "maximize" => ObjectiveDirection::Maximize,
                _ => ObjectiveDirection::Minimize,
            };
            return Ok((id, stored));
        }

        self.connection
            .execute(
                "INSERT INTO studies (name, direction, created_at) VALUES (?1, ?2, ?3)",
                params![name, direction.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(storage_err)?;
        tracing::debug!(study = name, "created study");
        Ok((self.connection.last_insert_rowid(), direction))
    }

    /// Insert or replace a trial along with its intermediate values.
    pub fn save_trial(&mut self, study_id: i64, trial: &TrialRecord) -> StudyResult<()> {
        let params_json = serde_json::to_string(&trial.params).map_err(storage_err)?;
        let number = trial.number as i64;

        let tx = self.connection.transaction().map_err(storage_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO trials
             (study_id, number, state, params, value, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                study_id,
                number,
                trial.state.as_str(),
                params_json,
                trial.value,
                trial.created_at.to_rfc3339(),
                trial.finished_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(storage_err)?;

        for (step, value) in &trial.intermediate_values {
            tx.execute(
                "INSERT OR REPLACE INTO intermediate_values (study_id, number, step, value)
                 VALUES (?1, ?2, ?3, ?4)",
                params![study_id, number, *step as i64, value],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)
    }

    /// All trials of a study, ordered by number.
    pub fn load_trials(&self, study_id: i64) -> StudyResult<Vec<TrialRecord>> {
        let mut stmt = self
            .connection
            .prepare(
                "SELECT number, state, params, value, created_at, finished_at
                 FROM trials WHERE study_id = ?1 ORDER BY number",
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map(params![study_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(storage_err)?;

        let mut trials = Vec::new();
        for row in rows {
            let (number, state, params_json, value, created_at, finished_at) =
                row.map_err(storage_err)?;
            let params: Params = serde_json::from_str(&params_json).map_err(storage_err)?;
            let state = TrialState::parse(&state)
                .ok_or_else(|| storage_err(format!("unknown trial state {state}")))?;

            trials.push(TrialRecord {
                number: number as u64,
                state,
                params,
                intermediate_values: self.load_intermediate_values(study_id, number)?,
                value,
                created_at: parse_time(&created_at)?,
                finished_at: finished_at.as_deref().map(parse_time).transpose()?,
            });
        }
        Ok(trials)
    }

    fn load_intermediate_values(&self, study_id: i64, number: i64) -> StudyResult<BTreeMap<u64, f64>> {
        let mut stmt = self
            .connection
            .prepare(
                "SELECT step, value FROM intermediate_values
                 WHERE study_id = ?1 AND number = ?2",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![study_id, number], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, f64>(1)?))
            })
            .map_err(storage_err)?;

        rows.collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(storage_err)
    }
}
