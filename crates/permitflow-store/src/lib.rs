use anyhow::{Result, anyhow};
use chrono::Utc;
use permitflow_core::{
    Hazard, Permit, RunMeta, StructuredResult, Validation, WorkOrderStatus, runtime_dir,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS buckets (
            bucket TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (bucket, key)
         );",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS run_history (
            run_id TEXT PRIMARY KEY,
            work_order_id TEXT NOT NULL,
            outcome TEXT NOT NULL,
            stage TEXT,
            frames INTEGER NOT NULL,
            malformed_frames INTEGER NOT NULL,
            error TEXT,
            at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_run_history_work_order
            ON run_history(work_order_id, at);",
    ),
];

/// Independent keyed buckets. Writes to different buckets are not atomic
/// with respect to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Permit list by work-order id.
    Permits,
    /// Local work-order status by work-order id.
    WoStatus,
    /// Hazard list by work-order id.
    Hazards,
    /// Validation by permit id.
    Validation,
    /// Agent session id by work-order id.
    AgentSession,
    /// Run metadata and PDF links by work-order id.
    RunMeta,
    Identity,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Permits => "permits",
            Bucket::WoStatus => "wo_status",
            Bucket::Hazards => "hazards",
            Bucket::Validation => "validation",
            Bucket::AgentSession => "agent_session",
            Bucket::RunMeta => "run_meta",
            Bucket::Identity => "identity",
        }
    }
}

const USER_ID_KEY: &str = "user_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub work_order_id: String,
    pub run_meta: RunMeta,
    #[serde(default)]
    pub pdf_links: Vec<String>,
    pub completed_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistoryRecord {
    pub run_id: Uuid,
    pub work_order_id: String,
    pub outcome: String,
    pub stage: Option<String>,
    pub frames: u64,
    pub malformed_frames: u64,
    pub error: Option<String>,
    pub at: String,
}

impl RunHistoryRecord {
    pub fn completed(work_order_id: &str, stage: &str, frames: usize, malformed: usize) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            work_order_id: work_order_id.to_string(),
            outcome: "completed".to_string(),
            stage: Some(stage.to_string()),
            frames: frames as u64,
            malformed_frames: malformed as u64,
            error: None,
            at: Utc::now().to_rfc3339(),
        }
    }

    pub fn failed(work_order_id: &str, error: &str) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            work_order_id: work_order_id.to_string(),
            outcome: "failed".to_string(),
            stage: None,
            frames: 0,
            malformed_frames: 0,
            error: Some(error.to_string()),
            at: Utc::now().to_rfc3339(),
        }
    }
}

pub struct Store {
    pub root: PathBuf,
    db_path: PathBuf,
}

impl Store {
    pub fn new(workspace: &Path) -> Result<Self> {
        let root = runtime_dir(workspace);
        fs::create_dir_all(&root)?;
        let db_path = root.join("store.sqlite");
        let store = Self { root, db_path };
        store.init_db()?;
        Ok(store)
    }

    pub fn db(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn get_json<T: DeserializeOwned>(&self, bucket: Bucket, key: &str) -> Result<Option<T>> {
        let conn = self.db()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM buckets WHERE bucket = ?1 AND key = ?2",
                params![bucket.as_str(), key],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(|err| anyhow!("corrupt {} entry '{key}': {err}", bucket.as_str()))
    }

    pub fn put_json<T: Serialize + ?Sized>(
        &self,
        bucket: Bucket,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT OR REPLACE INTO buckets (bucket, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                bucket.as_str(),
                key,
                serde_json::to_string(value)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Every `(key, value)` pair of a bucket, ordered by key.
    pub fn entries<T: DeserializeOwned>(&self, bucket: Bucket) -> Result<Vec<(String, T)>> {
        let conn = self.db()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM buckets WHERE bucket = ?1 ORDER BY key ASC")?;
        let rows = stmt.query_map([bucket.as_str()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            let value = serde_json::from_str(&raw)
                .map_err(|err| anyhow!("corrupt {} entry '{key}': {err}", bucket.as_str()))?;
            out.push((key, value));
        }
        Ok(out)
    }

    pub fn get_permits(&self, work_order_id: &str) -> Result<Vec<Permit>> {
        Ok(self
            .get_json(Bucket::Permits, work_order_id)?
            .unwrap_or_default())
    }

    pub fn save_permits(&self, work_order_id: &str, permits: &[Permit]) -> Result<()> {
        self.put_json(Bucket::Permits, work_order_id, permits)
    }

    /// Find a permit by id across all work orders.
    pub fn get_permit(&self, permit_id: &str) -> Result<Option<(String, Permit)>> {
        for (work_order_id, permits) in self.entries::<Vec<Permit>>(Bucket::Permits)? {
            if let Some(permit) = permits.into_iter().find(|p| p.permit_id == permit_id) {
                return Ok(Some((work_order_id, permit)));
            }
        }
        Ok(None)
    }

    /// Apply `update` to the stored permit and write its work order's list back.
    pub fn update_permit<F>(&self, permit_id: &str, update: F) -> Result<Permit>
    where
        F: FnOnce(&mut Permit) -> Result<()>,
    {
        for (work_order_id, mut permits) in self.entries::<Vec<Permit>>(Bucket::Permits)? {
            let Some(permit) = permits.iter_mut().find(|p| p.permit_id == permit_id) else {
                continue;
            };
            update(permit)?;
            let updated = permit.clone();
            self.save_permits(&work_order_id, &permits)?;
            return Ok(updated);
        }
        Err(anyhow!("permit not found: {permit_id}"))
    }

    pub fn get_status(&self, work_order_id: &str) -> Result<WorkOrderStatus> {
        Ok(self
            .get_json(Bucket::WoStatus, work_order_id)?
            .unwrap_or_default())
    }

    pub fn set_status(&self, work_order_id: &str, status: WorkOrderStatus) -> Result<()> {
        self.put_json(Bucket::WoStatus, work_order_id, &status)
    }

    pub fn get_hazards(&self, work_order_id: &str) -> Result<Vec<Hazard>> {
        Ok(self
            .get_json(Bucket::Hazards, work_order_id)?
            .unwrap_or_default())
    }

    pub fn save_hazards(&self, work_order_id: &str, hazards: &[Hazard]) -> Result<()> {
        self.put_json(Bucket::Hazards, work_order_id, hazards)
    }

    pub fn get_validation(&self, permit_id: &str) -> Result<Option<Validation>> {
        self.get_json(Bucket::Validation, permit_id)
    }

    pub fn save_validation(&self, validation: &Validation) -> Result<()> {
        self.put_json(Bucket::Validation, &validation.permit_id, validation)
    }

    /// Stable local user id, generated on first use.
    pub fn user_id(&self) -> Result<String> {
        if let Some(existing) = self.get_json::<String>(Bucket::Identity, USER_ID_KEY)? {
            return Ok(existing);
        }
        let generated = format!("user-{}", Uuid::now_v7());
        self.put_json(Bucket::Identity, USER_ID_KEY, &generated)?;
        Ok(generated)
    }

    /// Agent session id for a work order, generated on first use.
    pub fn agent_session_id(&self, work_order_id: &str) -> Result<String> {
        if let Some(existing) = self.get_json::<String>(Bucket::AgentSession, work_order_id)? {
            return Ok(existing);
        }
        let generated = format!("session-{}", Uuid::now_v7());
        self.put_json(Bucket::AgentSession, work_order_id, &generated)?;
        Ok(generated)
    }

    pub fn save_run_record(&self, record: &RunRecord) -> Result<()> {
        self.put_json(Bucket::RunMeta, &record.work_order_id, record)
    }

    pub fn get_run_record(&self, work_order_id: &str) -> Result<Option<RunRecord>> {
        self.get_json(Bucket::RunMeta, work_order_id)
    }

    /// Persist an extracted result: permits and hazards under the work order,
    /// one validation per permit, and the run metadata.
    pub fn apply_result(&self, work_order_id: &str, result: &StructuredResult) -> Result<()> {
        let permits: Vec<Permit> = result
            .permits
            .iter()
            .cloned()
            .map(|mut permit| {
                if permit.work_order_id.trim().is_empty() {
                    permit.work_order_id = work_order_id.to_string();
                }
                permit
            })
            .collect();
        self.save_permits(work_order_id, &permits)?;
        self.save_hazards(work_order_id, &result.hazards)?;
        for validation in &result.validations {
            self.save_validation(validation)?;
        }
        self.save_run_record(&RunRecord {
            work_order_id: work_order_id.to_string(),
            run_meta: result.run_meta.clone(),
            pdf_links: result.pdf_links.clone(),
            completed_at: Utc::now().to_rfc3339(),
        })
    }

    pub fn append_run_history(&self, record: &RunHistoryRecord) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO run_history (run_id, work_order_id, outcome, stage, frames, malformed_frames, error, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.run_id.to_string(),
                record.work_order_id,
                record.outcome,
                record.stage,
                record.frames as i64,
                record.malformed_frames as i64,
                record.error,
                record.at,
            ],
        )?;
        Ok(())
    }

    /// Runs for one work order, oldest first.
    pub fn list_run_history(&self, work_order_id: &str) -> Result<Vec<RunHistoryRecord>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, work_order_id, outcome, stage, frames, malformed_frames, error, at
             FROM run_history WHERE work_order_id = ?1 ORDER BY at ASC, run_id ASC",
        )?;
        let rows = stmt.query_map([work_order_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                RunHistoryRecord {
                    run_id: Uuid::nil(),
                    work_order_id: r.get(1)?,
                    outcome: r.get(2)?,
                    stage: r.get(3)?,
                    frames: r.get::<_, i64>(4)?.max(0) as u64,
                    malformed_frames: r.get::<_, i64>(5)?.max(0) as u64,
                    error: r.get(6)?,
                    at: r.get(7)?,
                },
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (run_id, mut record) = row?;
            record.run_id = Uuid::parse_str(&run_id)?;
            out.push(record);
        }
        Ok(out)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;

        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }
}
