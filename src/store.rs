//! SQLite-backed persistence for runs, responses, metrics, and brand
//! history.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::provider::SourceRef;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// Row to record when a task is dispatched, before the provider answers.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub provider: String,
    pub model: String,
    pub prompt_id: Option<String>,
    pub category: Option<String>,
    pub mode: String,
    pub question: String,
    pub prompt_text: String,
    pub market: Option<String>,
    pub lang: Option<String>,
    pub raw: bool,
    pub brand_name: String,
    pub company_id: Option<String>,
}

/// The provider's answer for a run row.
#[derive(Debug, Clone)]
pub struct NewResponse {
    pub run_id: i64,
    pub response_text: String,
    pub latency_ms: Option<u64>,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub cost_usd: Option<f64>,
    pub sources: Vec<SourceRef>,
}

/// Scores computed for a run row.
#[derive(Debug, Clone)]
pub struct NewMetrics {
    pub run_id: i64,
    pub presence: Option<f64>,
    pub sentiment: Option<f64>,
    pub trust_authority: Option<f64>,
    pub trust_brand: Option<f64>,
    pub brand_mentioned: bool,
    pub other_brands: Vec<String>,
}

/// One entry in a brand's run history.
#[derive(Debug, Clone)]
pub struct BrandRunRecord {
    pub brand_id: i64,
    pub job_id: Option<String>,
    pub providers: Vec<String>,
    pub mode: String,
    pub total_queries: usize,
    pub visibility_pct: f64,
    pub avg_sentiment: Option<f64>,
    pub avg_trust: Option<f64>,
    pub competitor_summary: serde_json::Value,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: NewRun) -> Result<i64, StoreError>;
    async fn insert_response(&self, response: NewResponse) -> Result<(), StoreError>;
    async fn insert_metrics(&self, metrics: NewMetrics) -> Result<(), StoreError>;
    async fn get_or_create_brand(
        &self,
        name: &str,
        industry: Option<&str>,
        market: Option<&str>,
        company_id: Option<&str>,
    ) -> Result<i64, StoreError>;
    async fn record_brand_run(&self, record: BrandRunRecord) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct SqliteRunStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        Self::init(&conn)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             CREATE TABLE IF NOT EXISTS runs (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               run_ts TEXT NOT NULL,\
               provider TEXT NOT NULL,\
               model TEXT NOT NULL,\
               prompt_id TEXT,\
               category TEXT,\
               mode TEXT NOT NULL,\
               question TEXT NOT NULL,\
               prompt_text TEXT NOT NULL,\
               market TEXT,\
               lang TEXT,\
               raw INTEGER NOT NULL DEFAULT 0,\
               brand_name TEXT NOT NULL,\
               company_id TEXT\
             );\
             CREATE TABLE IF NOT EXISTS responses (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               run_id INTEGER NOT NULL REFERENCES runs(id),\
               response_text TEXT NOT NULL,\
               latency_ms INTEGER,\
               tokens_in INTEGER,\
               tokens_out INTEGER,\
               cost_usd REAL,\
               provider_sources TEXT NOT NULL DEFAULT '[]'\
             );\
             CREATE TABLE IF NOT EXISTS metrics (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               run_id INTEGER NOT NULL REFERENCES runs(id),\
               presence REAL,\
               sentiment REAL,\
               trust_authority REAL,\
               trust_brand REAL,\
               brand_mentioned INTEGER NOT NULL DEFAULT 0,\
               other_brands TEXT NOT NULL DEFAULT '[]'\
             );\
             CREATE TABLE IF NOT EXISTS brands (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               name TEXT NOT NULL,\
               industry TEXT,\
               market TEXT,\
               company_id TEXT,\
               created_at TEXT NOT NULL,\
               UNIQUE(name, market)\
             );\
             CREATE TABLE IF NOT EXISTS brand_runs (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               brand_id INTEGER NOT NULL REFERENCES brands(id),\
               job_id TEXT,\
               run_at TEXT NOT NULL,\
               providers TEXT NOT NULL DEFAULT '[]',\
               mode TEXT NOT NULL,\
               total_queries INTEGER NOT NULL,\
               visibility_pct REAL NOT NULL,\
               avg_sentiment REAL,\
               avg_trust REAL,\
               competitor_summary TEXT NOT NULL DEFAULT '{}'\
             );\
             CREATE INDEX IF NOT EXISTS idx_responses_run ON responses(run_id);\
             CREATE INDEX IF NOT EXISTS idx_metrics_run ON metrics(run_id);\
             CREATE INDEX IF NOT EXISTS idx_brand_runs_brand ON brand_runs(brand_id);",
        )?;
        Ok(())
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serde(e.to_string()))
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn insert_run(&self, run: NewRun) -> Result<i64, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO runs (\
                        run_ts, provider, model, prompt_id, category, mode,\
                        question, prompt_text, market, lang, raw, brand_name, company_id\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        Utc::now().to_rfc3339(),
                        run.provider,
                        run.model,
                        run.prompt_id,
                        run.category,
                        run.mode,
                        run.question,
                        run.prompt_text,
                        run.market,
                        run.lang,
                        run.raw as i64,
                        run.brand_name,
                        run.company_id,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn insert_response(&self, response: NewResponse) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let sources = to_json(&response.sources)?;
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO responses (\
                        run_id, response_text, latency_ms, tokens_in, tokens_out,\
                        cost_usd, provider_sources\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        response.run_id,
                        response.response_text,
                        response.latency_ms.map(|v| v as i64),
                        response.tokens_in.map(|v| v as i64),
                        response.tokens_out.map(|v| v as i64),
                        response.cost_usd,
                        sources,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn insert_metrics(&self, metrics: NewMetrics) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let other_brands = to_json(&metrics.other_brands)?;
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO metrics (\
                        run_id, presence, sentiment, trust_authority, trust_brand,\
                        brand_mentioned, other_brands\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        metrics.run_id,
                        metrics.presence,
                        metrics.sentiment,
                        metrics.trust_authority,
                        metrics.trust_brand,
                        metrics.brand_mentioned as i64,
                        other_brands,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn get_or_create_brand(
        &self,
        name: &str,
        industry: Option<&str>,
        market: Option<&str>,
        company_id: Option<&str>,
    ) -> Result<i64, StoreError> {
        let store = self.clone();
        let name = name.to_string();
        let industry = industry.map(str::to_string);
        let market = market.map(str::to_string);
        let company_id = company_id.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                // IS comparison so a NULL market still matches
                let existing: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM brands WHERE name = ?1 AND market IS ?2",
                        params![name, market],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                if let Some(id) = existing {
                    return Ok(id);
                }
                conn.execute(
                    "INSERT INTO brands (name, industry, market, company_id, created_at)\
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![name, industry, market, company_id, Utc::now().to_rfc3339()],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn record_brand_run(&self, record: BrandRunRecord) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let providers = to_json(&record.providers)?;
            let competitors = to_json(&record.competitor_summary)?;
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO brand_runs (\
                        brand_id, job_id, run_at, providers, mode, total_queries,\
                        visibility_pct, avg_sentiment, avg_trust, competitor_summary\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        record.brand_id,
                        record.job_id,
                        Utc::now().to_rfc3339(),
                        providers,
                        record.mode,
                        record.total_queries as i64,
                        record.visibility_pct,
                        record.avg_sentiment,
                        record.avg_trust,
                        competitors,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}
