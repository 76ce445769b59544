use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use serde_json::Value;
use tracing::info;

use crate::config::Configuration;
use crate::coordinator::JobState;
use crate::scoring::ScoredResult;
use crate::trade::TradeRecord;

/// Message persisted when the predefined filters leave no trades.
pub const NO_TRADES_MESSAGE: &str = "No trades matched the predefined filters.";

pub trait ConfigRepository: Send + Sync {
    fn get(&self, id: u64) -> Result<Option<Configuration>>;
}

pub trait TradeRepository: Send + Sync {
    /// Read-only bulk load of every trade for `instrument`.
    fn find_all(&self, instrument: &str) -> Result<Vec<TradeRecord>>;
}

/// Final result of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultPayload {
    Ranked(Vec<ScoredResult>),
    /// Results produced by the external optimizer, kept as emitted.
    Raw(Vec<Value>),
    NoTradesMatched,
}

impl ResultPayload {
    pub fn len(&self) -> usize {
        match self {
            ResultPayload::Ranked(results) => results.len(),
            ResultPayload::Raw(results) => results.len(),
            ResultPayload::NoTradesMatched => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Result<Value> {
        match self {
            ResultPayload::Ranked(results) => {
                serde_json::to_value(results).context("failed to encode ranked results")
            }
            ResultPayload::Raw(results) => Ok(Value::Array(results.clone())),
            ResultPayload::NoTradesMatched => Ok(serde_json::json!({ "message": NO_TRADES_MESSAGE })),
        }
    }
}

pub trait ResultRepository: Send + Sync {
    fn save(
        &self,
        configuration: &Configuration,
        payload: &ResultPayload,
        started_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Most recently saved payload for a configuration.
    fn latest(&self, configuration_id: u64) -> Result<Option<Value>>;
}

/// Per-job scored rows written independently by workers.
pub trait TransientResultRepository: Send + Sync {
    fn save(&self, job_id: &str, score: f64, payload: &str) -> Result<()>;
    /// Highest scores first; equal scores fall back to payload order.
    fn top_n_by_score(&self, job_id: &str, n: usize) -> Result<Vec<String>>;
    fn delete_all(&self, job_id: &str) -> Result<()>;
    fn count(&self, job_id: &str) -> Result<usize>;
}

pub trait JobStateStore: Send + Sync {
    fn load(&self, job_id: &str) -> Result<Option<JobState>>;
    fn save(&self, state: &JobState) -> Result<()>;
    fn delete(&self, job_id: &str) -> Result<()>;
}

// =============================================================================
// DuckDB store
// =============================================================================

/// DuckDB-backed transient results, final results and job checkpoints.
pub struct DuckStore {
    conn: Mutex<Connection>,
}

impl DuckStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Unable to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Unable to open {}", path.display()))?;
        info!(db_path = %path.display(), "DuckStore opened DuckDB connection");
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Unable to open in-memory DuckDB")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS transient_results (
                job_id TEXT NOT NULL,
                score DOUBLE NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS optimization_results (
                configuration_id BIGINT NOT NULL,
                configuration_name TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TIMESTAMP NOT NULL,
                result_count BIGINT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS job_states (
                job_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("DuckDB connection lock poisoned"))
    }
}

impl TransientResultRepository for DuckStore {
    fn save(&self, job_id: &str, score: f64, payload: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO transient_results (job_id, score, payload) VALUES (?, ?, ?)",
            params![job_id, score, payload],
        )?;
        Ok(())
    }

    fn top_n_by_score(&self, job_id: &str, n: usize) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM transient_results \
             WHERE job_id = ? \
             ORDER BY score DESC, payload ASC \
             LIMIT ?",
        )?;
        let mut rows = stmt.query(params![job_id, n as i64])?;
        let mut payloads = Vec::new();
        while let Some(row) = rows.next()? {
            payloads.push(row.get::<_, String>(0)?);
        }
        Ok(payloads)
    }

    fn delete_all(&self, job_id: &str) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM transient_results WHERE job_id = ?",
            params![job_id],
        )?;
        Ok(())
    }

    fn count(&self, job_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM transient_results WHERE job_id = ?")?;
        let mut rows = stmt.query(params![job_id])?;
        match rows.next()? {
            Some(row) => Ok(row.get::<_, i64>(0)?.max(0) as usize),
            None => Ok(0),
        }
    }
}

impl ResultRepository for DuckStore {
    fn save(
        &self,
        configuration: &Configuration,
        payload: &ResultPayload,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let json = serde_json::to_string(&payload.to_json()?)?;
        self.conn()?.execute(
            "INSERT INTO optimization_results
                (configuration_id, configuration_name, started_at, finished_at, result_count, payload)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP, ?, ?)",
            params![
                configuration.id as i64,
                &configuration.name,
                started_at.to_rfc3339(),
                payload.len() as i64,
                json
            ],
        )?;
        Ok(())
    }

    fn latest(&self, configuration_id: u64) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM optimization_results \
             WHERE configuration_id = ? \
             ORDER BY finished_at DESC \
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![configuration_id as i64])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(
                    serde_json::from_str(&raw).context("stored result payload is not JSON")?,
                ))
            }
            None => Ok(None),
        }
    }
}

impl JobStateStore for DuckStore {
    fn load(&self, job_id: &str) -> Result<Option<JobState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT state FROM job_states WHERE job_id = ?")?;
        let mut rows = stmt.query(params![job_id])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let state = serde_json::from_str(&raw)
                    .with_context(|| format!("checkpoint for job {job_id} is corrupt"))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    fn save(&self, state: &JobState) -> Result<()> {
        let raw = serde_json::to_string(state).context("failed to encode job state")?;
        self.conn()?.execute(
            "INSERT INTO job_states (job_id, state, updated_at)
             VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(job_id) DO UPDATE
             SET state = excluded.state,
                 updated_at = excluded.updated_at",
            params![&state.job_id, raw],
        )?;
        Ok(())
    }

    fn delete(&self, job_id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM job_states WHERE job_id = ?", params![job_id])?;
        Ok(())
    }
}

// =============================================================================
// Configuration and trade catalogs
// =============================================================================

/// Data directory with `configs/<id>.json` and `trades/<instrument>.json`.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    root: PathBuf,
}

impl FileCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self, id: u64) -> PathBuf {
        self.root.join("configs").join(format!("{id}.json"))
    }

    pub fn trades_path(&self, instrument: &str) -> PathBuf {
        self.root.join("trades").join(format!("{instrument}.json"))
    }
}

impl ConfigRepository for FileCatalog {
    fn get(&self, id: u64) -> Result<Option<Configuration>> {
        let path = self.config_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Unable to read {}", path.display()))?;
        let configuration = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(Some(configuration))
    }
}

impl TradeRepository for FileCatalog {
    fn find_all(&self, instrument: &str) -> Result<Vec<TradeRecord>> {
        let path = self.trades_path(instrument);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Unable to read trades from {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid trade rows in {}", path.display()))
    }
}

/// In-memory catalog for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    configurations: HashMap<u64, Configuration>,
    trades: HashMap<String, Vec<TradeRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configurations.insert(configuration.id, configuration);
        self
    }

    pub fn with_trades(mut self, instrument: impl Into<String>, trades: Vec<TradeRecord>) -> Self {
        self.trades.insert(instrument.into(), trades);
        self
    }
}

impl ConfigRepository for MemoryCatalog {
    fn get(&self, id: u64) -> Result<Option<Configuration>> {
        Ok(self.configurations.get(&id).cloned())
    }
}

impl TradeRepository for MemoryCatalog {
    fn find_all(&self, instrument: &str) -> Result<Vec<TradeRecord>> {
        Ok(self.trades.get(instrument).cloned().unwrap_or_default())
    }
}
