//! SQLite-backed persistence for surveys, personas, runs, results, and settings.
//!
//! The executor, generator, and labeler only see the [`SurveyStore`] trait so
//! tests can wrap or replace the backend.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use crate::demographics::DemographicProfile;
use crate::model::{
    DemographicConfig, NewPersona, NewResult, Persona, Probe, ResultRecord, RunStatus, Survey,
    SurveyRun,
};

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store closed")]
    Closed,
    #[error("task join error: {0}")]
    Join(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

// =============================================================================
// Trait
// =============================================================================

/// Totals written alongside a run's results when it completes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunTotals {
    pub tokens_used: i64,
    pub total_cost: f64,
}

/// Every store access the engine makes.
#[async_trait]
pub trait SurveyStore: Send + Sync {
    async fn get_run(&self, run_id: i64) -> Result<SurveyRun, StoreError>;

    /// Move a run from QUEUED to MATCHING. Returns `false` if the run exists but
    /// was not QUEUED (already claimed or finished).
    async fn claim_run(&self, run_id: i64) -> Result<bool, StoreError>;

    /// Set a non-terminal run's status. A COMPLETED or FAILED run is never
    /// rewritten; that case is a [`StoreError::Conflict`].
    async fn update_run_status(&self, run_id: i64, status: RunStatus) -> Result<(), StoreError>;

    /// Mark a run FAILED unless it already finished. Returns `false` if the run
    /// was COMPLETED or FAILED and was left unchanged.
    async fn fail_run(&self, run_id: i64) -> Result<bool, StoreError>;

    /// Insert all results and mark the run COMPLETED in one transaction.
    async fn commit_run_results(
        &self,
        run_id: i64,
        results: Vec<NewResult>,
        totals: RunTotals,
    ) -> Result<(), StoreError>;

    async fn list_results(&self, run_id: i64) -> Result<Vec<ResultRecord>, StoreError>;

    /// Probes of a survey, in insertion order.
    async fn list_probes(&self, survey_id: i64) -> Result<Vec<Probe>, StoreError>;

    async fn get_demographic_config(&self, config_id: i64)
        -> Result<DemographicConfig, StoreError>;

    async fn list_personas(&self) -> Result<Vec<Persona>, StoreError>;

    async fn insert_persona(&self, persona: NewPersona) -> Result<i64, StoreError>;

    /// Set one key of a persona's `custom_tags`, keeping every other key as
    /// currently stored.
    async fn set_persona_tag(
        &self,
        persona_id: i64,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    async fn get_configuration(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn get_feature_flag(&self, name: &str) -> Result<Option<bool>, StoreError>;
}

// =============================================================================
// SQLite store
// =============================================================================

#[derive(Clone)]
pub struct SqliteSurveyStore {
    conn: Arc<Mutex<Connection>>,
    /// Only one blocking thread waits on the connection mutex at a time.
    sem: Arc<Semaphore>,
}

impl SqliteSurveyStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("ALTERITY_DB_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".alterity.sqlite")
    }

    /// Lock the connection. A poisoned mutex still guards a usable connection.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError>,
    {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS surveys (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               name TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS probes (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               survey_id INTEGER NOT NULL REFERENCES surveys(id) ON DELETE CASCADE,\
               content TEXT NOT NULL,\
               type TEXT NOT NULL DEFAULT 'TEXT',\
               options TEXT,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS demographic_configs (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               name TEXT NOT NULL,\
               constraints TEXT NOT NULL DEFAULT '{}',\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS personas (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               content TEXT NOT NULL,\
               model_signature TEXT NOT NULL,\
               demographics TEXT NOT NULL DEFAULT '{}',\
               custom_tags TEXT NOT NULL DEFAULT '{}',\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS survey_runs (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               survey_id INTEGER NOT NULL REFERENCES surveys(id),\
               config_id INTEGER REFERENCES demographic_configs(id),\
               methodology TEXT NOT NULL,\
               status TEXT NOT NULL DEFAULT 'QUEUED',\
               run_config TEXT NOT NULL DEFAULT '{}',\
               tokens_used INTEGER NOT NULL DEFAULT 0,\
               total_cost REAL NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               completed_at INTEGER\
             );\
             CREATE TABLE IF NOT EXISTS results (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               run_id INTEGER NOT NULL REFERENCES survey_runs(id) ON DELETE CASCADE,\
               probe_id INTEGER NOT NULL REFERENCES probes(id),\
               persona_id INTEGER REFERENCES personas(id),\
               response TEXT NOT NULL,\
               usage_cost REAL NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS configurations (\
               key TEXT PRIMARY KEY,\
               value TEXT NOT NULL,\
               description TEXT,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS feature_flags (\
               name TEXT PRIMARY KEY,\
               is_enabled INTEGER NOT NULL DEFAULT 0,\
               properties TEXT NOT NULL DEFAULT '{}',\
               updated_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_probes_survey ON probes(survey_id);\
             CREATE INDEX IF NOT EXISTS idx_results_run ON results(run_id);\
             CREATE INDEX IF NOT EXISTS idx_runs_status ON survey_runs(status);",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Seeding (surveys, probes, configs, runs)
    // -------------------------------------------------------------------------

    pub async fn create_survey(&self, name: &str) -> Result<Survey, StoreError> {
        let name = name.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO surveys (name, created_at) VALUES (?1, ?2)",
                params![name, now_epoch()],
            )?;
            Ok(Survey {
                id: conn.last_insert_rowid(),
                name,
            })
        })
        .await
    }

    pub async fn add_probe(
        &self,
        survey_id: i64,
        content: &str,
        probe_type: &str,
        options: Option<Value>,
    ) -> Result<i64, StoreError> {
        let content = content.to_string();
        let probe_type = probe_type.to_string();
        let options = options.map(|v| serde_json::to_string(&v)).transpose()?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO probes (survey_id, content, type, options, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![survey_id, content, probe_type, options, now_epoch()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn create_demographic_config(
        &self,
        name: &str,
        constraints: &DemographicProfile,
    ) -> Result<i64, StoreError> {
        let name = name.to_string();
        let constraints = serde_json::to_string(constraints)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO demographic_configs (name, constraints, created_at) VALUES (?1, ?2, ?3)",
                params![name, constraints, now_epoch()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Insert a QUEUED run.
    pub async fn create_run(
        &self,
        survey_id: i64,
        config_id: Option<i64>,
        methodology: &str,
        run_config: Map<String, Value>,
    ) -> Result<i64, StoreError> {
        let methodology = methodology.to_string();
        let run_config = serde_json::to_string(&run_config)?;
        self.blocking(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO survey_runs (survey_id, config_id, methodology, status, run_config, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    survey_id,
                    config_id,
                    methodology,
                    RunStatus::Queued.as_str(),
                    run_config,
                    now,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Settings
    // -------------------------------------------------------------------------

    pub async fn set_configuration(
        &self,
        key: &str,
        value: &Value,
        description: Option<&str>,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = serde_json::to_string(value)?;
        let description = description.map(str::to_string);
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO configurations (key, value, description, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 description = COALESCE(excluded.description, configurations.description), \
                 updated_at = excluded.updated_at",
                params![key, value, description, now_epoch()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_feature_flag(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let name = name.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO feature_flags (name, is_enabled, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(name) DO UPDATE SET is_enabled = excluded.is_enabled, \
                 updated_at = excluded.updated_at",
                params![name, enabled, now_epoch()],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SurveyStore for SqliteSurveyStore {
    async fn get_run(&self, run_id: i64) -> Result<SurveyRun, StoreError> {
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT id, survey_id, config_id, methodology, status, run_config, tokens_used, \
                 total_cost, created_at, completed_at FROM survey_runs WHERE id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
        })
        .await
    }

    async fn claim_run(&self, run_id: i64) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let rows = conn.execute(
                "UPDATE survey_runs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    RunStatus::Matching.as_str(),
                    now_epoch(),
                    run_id,
                    RunStatus::Queued.as_str(),
                ],
            )?;
            if rows == 1 {
                return Ok(true);
            }
            if run_exists(conn, run_id)? {
                Ok(false)
            } else {
                Err(StoreError::NotFound(format!("run {run_id}")))
            }
        })
        .await
    }

    async fn update_run_status(&self, run_id: i64, status: RunStatus) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let rows = conn.execute(
                &format!(
                    "UPDATE survey_runs SET status = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND {UNFINISHED}"
                ),
                params![status.as_str(), now_epoch(), run_id],
            )?;
            if rows == 1 {
                return Ok(());
            }
            if run_exists(conn, run_id)? {
                Err(StoreError::Conflict(format!(
                    "run {run_id} already finished; not moving it to {}",
                    status.as_str()
                )))
            } else {
                Err(StoreError::NotFound(format!("run {run_id}")))
            }
        })
        .await
    }

    async fn fail_run(&self, run_id: i64) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let rows = conn.execute(
                &format!(
                    "UPDATE survey_runs SET status = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND {UNFINISHED}"
                ),
                params![RunStatus::Failed.as_str(), now_epoch(), run_id],
            )?;
            if rows == 1 {
                return Ok(true);
            }
            if run_exists(conn, run_id)? {
                Ok(false)
            } else {
                Err(StoreError::NotFound(format!("run {run_id}")))
            }
        })
        .await
    }

    async fn commit_run_results(
        &self,
        run_id: i64,
        results: Vec<NewResult>,
        totals: RunTotals,
    ) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let now = now_epoch();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO results (run_id, probe_id, persona_id, response, usage_cost, \
                     created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for result in &results {
                    let response = serde_json::json!({ "text": result.text }).to_string();
                    stmt.execute(params![
                        run_id,
                        result.probe_id,
                        result.persona_id,
                        response,
                        result.usage_cost,
                        now,
                    ])?;
                }
            }
            let rows = tx.execute(
                &format!(
                    "UPDATE survey_runs SET status = ?1, tokens_used = ?2, total_cost = ?3, \
                     completed_at = ?4, updated_at = ?4 WHERE id = ?5 AND {UNFINISHED}"
                ),
                params![
                    RunStatus::Completed.as_str(),
                    totals.tokens_used,
                    totals.total_cost,
                    now,
                    run_id,
                ],
            )?;
            if rows == 0 {
                // Dropping the transaction rolls back the inserted results.
                return Err(if run_exists(&tx, run_id)? {
                    StoreError::Conflict(format!("run {run_id} already finished"))
                } else {
                    StoreError::NotFound(format!("run {run_id}"))
                });
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_results(&self, run_id: i64) -> Result<Vec<ResultRecord>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, probe_id, persona_id, response, usage_cost \
                 FROM results WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![run_id], row_to_result)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn list_probes(&self, survey_id: i64) -> Result<Vec<Probe>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, survey_id, content, type, options FROM probes \
                 WHERE survey_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![survey_id], row_to_probe)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn get_demographic_config(
        &self,
        config_id: i64,
    ) -> Result<DemographicConfig, StoreError> {
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT id, name, constraints FROM demographic_configs WHERE id = ?1",
                params![config_id],
                |row| {
                    Ok(DemographicConfig {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        constraints: json_column(row, 2)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("demographic config {config_id}")))
        })
        .await
    }

    async fn list_personas(&self) -> Result<Vec<Persona>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content, model_signature, demographics, custom_tags \
                 FROM personas ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], row_to_persona)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn insert_persona(&self, persona: NewPersona) -> Result<i64, StoreError> {
        let demographics = serde_json::to_string(&persona.demographics)?;
        let custom_tags = serde_json::to_string(&persona.custom_tags)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO personas (content, model_signature, demographics, custom_tags, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    persona.content,
                    persona.model_signature,
                    demographics,
                    custom_tags,
                    now_epoch(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn set_persona_tag(
        &self,
        persona_id: i64,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let raw: String = tx
                .query_row(
                    "SELECT custom_tags FROM personas WHERE id = ?1",
                    params![persona_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("persona {persona_id}")))?;
            let mut tags: Map<String, Value> = serde_json::from_str(&raw)?;
            tags.insert(key, value);
            tx.execute(
                "UPDATE personas SET custom_tags = ?1 WHERE id = ?2",
                params![serde_json::to_string(&tags)?, persona_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_configuration(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = key.to_string();
        let raw: Option<String> = self
            .blocking(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM configurations WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    async fn get_feature_flag(&self, name: &str) -> Result<Option<bool>, StoreError> {
        let name = name.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT is_enabled FROM feature_flags WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<SurveyRun> {
    let status: String = row.get(4)?;
    let status = RunStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown run status '{status}'").into(),
        )
    })?;
    Ok(SurveyRun {
        id: row.get(0)?,
        survey_id: row.get(1)?,
        config_id: row.get(2)?,
        methodology: row.get(3)?,
        status,
        run_config: json_column(row, 5)?,
        tokens_used: row.get(6)?,
        total_cost: row.get(7)?,
        created_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

fn row_to_probe(row: &rusqlite::Row<'_>) -> rusqlite::Result<Probe> {
    let options = match row.get::<_, Option<String>>(4)? {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(Probe {
        id: row.get(0)?,
        survey_id: row.get(1)?,
        content: row.get(2)?,
        probe_type: row.get(3)?,
        options,
    })
}

fn row_to_persona(row: &rusqlite::Row<'_>) -> rusqlite::Result<Persona> {
    Ok(Persona {
        id: row.get(0)?,
        content: row.get(1)?,
        model_signature: row.get(2)?,
        demographics: json_column(row, 3)?,
        custom_tags: json_column(row, 4)?,
    })
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRecord> {
    Ok(ResultRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        probe_id: row.get(2)?,
        persona_id: row.get(3)?,
        response: json_column(row, 4)?,
        usage_cost: row.get(5)?,
    })
}

/// SQL predicate matching runs that are neither COMPLETED nor FAILED.
const UNFINISHED: &str = "status NOT IN ('COMPLETED', 'FAILED')";

fn run_exists(conn: &Connection, run_id: i64) -> Result<bool, StoreError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM survey_runs WHERE id = ?1",
            params![run_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// =============================================================================
// Tests
// =============================================================================
