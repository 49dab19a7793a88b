//! libSQL backend — durable `JobStore` implementation.
//!
//! Supports local file, in-memory, and remote databases. The worker agent
//! connects to the same database as the orchestrator, so the conditional
//! update runs as a single guarded SQL statement (`WHERE id = ? AND
//! status = ?`) rather than an in-process lock.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::model::{
    JobFailure, JobOrigin, JobProgress, JobStatus, ScanConfig, ScanJob, ScanResult,
};
use crate::store::traits::{JobPatch, JobStore, apply_patch};

const JOB_COLUMNS: &str = "id, owner_ref, origin, config, status, progress, result, error, \
     cancel_requested, worker_ref, created_at, updated_at, started_at, completed_at";

/// libSQL job store.
///
/// Stores a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open database: {e}")))?;

        let backend = Self::from_db(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Job store opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to create database: {e}")))?;

        let backend = Self::from_db(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Connect to a remote database (worker agents reaching the shared store).
    pub async fn new_remote(url: String, auth_token: String) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_remote(url, auth_token)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect: {e}")))?;

        let backend = Self::from_db(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_db(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS scan_jobs (
                    id TEXT PRIMARY KEY,
                    owner_ref TEXT NOT NULL,
                    origin TEXT NOT NULL,
                    config TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    progress TEXT NOT NULL,
                    result TEXT,
                    error TEXT,
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    worker_ref TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_scan_jobs_status ON scan_jobs(status);
                CREATE INDEX IF NOT EXISTS idx_scan_jobs_owner ON scan_jobs(owner_ref);
                "#,
            )
            .await
            .map_err(|e| StoreError::Query(format!("init_schema: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 datetime string (our canonical write format).
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn origin_to_str(origin: JobOrigin) -> &'static str {
    match origin {
        JobOrigin::Native => "native",
        JobOrigin::ExternalPlatform => "external_platform",
    }
}

fn str_to_origin(s: &str) -> JobOrigin {
    match s {
        "external_platform" => JobOrigin::ExternalPlatform,
        _ => JobOrigin::Native,
    }
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Launching => "launching",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn str_to_status(s: &str) -> JobStatus {
    match s {
        "launching" => JobStatus::Launching,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        _ => JobStatus::Pending,
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(format!("{what}: {e}")))
}

fn opt_to_json<T: serde::Serialize>(
    value: &Option<T>,
    what: &str,
) -> Result<Option<String>, StoreError> {
    value.as_ref().map(|v| to_json(v, what)).transpose()
}

/// Map a libsql row to a ScanJob.
///
/// Column order matches JOB_COLUMNS:
/// 0:id, 1:owner_ref, 2:origin, 3:config, 4:status, 5:progress, 6:result,
/// 7:error, 8:cancel_requested, 9:worker_ref, 10:created_at, 11:updated_at,
/// 12:started_at, 13:completed_at
fn row_to_job(row: &libsql::Row) -> Result<ScanJob, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("id column: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Query(format!("invalid job id {id_str}: {e}")))?;

    let owner_ref: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("owner_ref column: {e}")))?;
    let origin_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("origin column: {e}")))?;
    let config_str: String = row
        .get(3)
        .map_err(|e| StoreError::Query(format!("config column: {e}")))?;
    let status_str: String = row
        .get(4)
        .map_err(|e| StoreError::Query(format!("status column: {e}")))?;
    let progress_str: String = row
        .get(5)
        .map_err(|e| StoreError::Query(format!("progress column: {e}")))?;
    let result_str: Option<String> = row.get(6).ok();
    let error_str: Option<String> = row.get(7).ok();
    let cancel_requested: i64 = row
        .get(8)
        .map_err(|e| StoreError::Query(format!("cancel_requested column: {e}")))?;
    let worker_ref: Option<String> = row.get(9).ok();
    let created_str: String = row
        .get(10)
        .map_err(|e| StoreError::Query(format!("created_at column: {e}")))?;
    let updated_str: String = row
        .get(11)
        .map_err(|e| StoreError::Query(format!("updated_at column: {e}")))?;
    let started_str: Option<String> = row.get(12).ok();
    let completed_str: Option<String> = row.get(13).ok();

    let config: ScanConfig = serde_json::from_str(&config_str)
        .map_err(|e| StoreError::Serialization(format!("config: {e}")))?;
    let progress: JobProgress = serde_json::from_str(&progress_str)
        .map_err(|e| StoreError::Serialization(format!("progress: {e}")))?;
    let result: Option<ScanResult> = result_str
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| StoreError::Serialization(format!("result: {e}")))?;
    let error: Option<JobFailure> = error_str
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| StoreError::Serialization(format!("error: {e}")))?;

    Ok(ScanJob {
        id,
        owner_ref,
        origin: str_to_origin(&origin_str),
        config,
        status: str_to_status(&status_str),
        progress,
        result,
        error,
        cancel_requested: cancel_requested != 0,
        worker_ref,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        started_at: started_str.as_deref().map(parse_datetime),
        completed_at: completed_str.as_deref().map(parse_datetime),
    })
}

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn create_record(&self, job: &ScanJob) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scan_jobs (id, owner_ref, origin, config, status, progress, result, error, cancel_requested, worker_ref, created_at, updated_at, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id.to_string(),
                job.owner_ref.clone(),
                origin_to_str(job.origin),
                to_json(&job.config, "config")?,
                status_to_str(job.status),
                to_json(&job.progress, "progress")?,
                opt_to_json(&job.result, "result")?,
                opt_to_json(&job.error, "error")?,
                job.cancel_requested as i64,
                job.worker_ref.clone(),
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("create_record: {e}")))?;

        debug!(job_id = %job.id, "Job record created");
        Ok(())
    }

    async fn read_record(&self, id: Uuid) -> Result<Option<ScanJob>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("read_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("read_record: {e}"))),
        }
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected_status: JobStatus,
        patch: JobPatch,
    ) -> Result<ScanJob, StoreError> {
        // Read-modify-write with a status guard on the final UPDATE. The
        // guard, not the read, is what makes the update conditional.
        let mut job = self
            .read_record(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        if job.status != expected_status {
            return Err(StoreError::Conflict {
                id,
                expected: expected_status.to_string(),
            });
        }

        apply_patch(&mut job, &patch);

        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE scan_jobs SET status = ?1, progress = ?2, result = ?3, error = ?4, \
                 cancel_requested = ?5, worker_ref = ?6, updated_at = ?7, started_at = ?8, \
                 completed_at = ?9 WHERE id = ?10 AND status = ?11",
                params![
                    status_to_str(job.status),
                    to_json(&job.progress, "progress")?,
                    opt_to_json(&job.result, "result")?,
                    opt_to_json(&job.error, "error")?,
                    job.cancel_requested as i64,
                    job.worker_ref.clone(),
                    job.updated_at.to_rfc3339(),
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    id.to_string(),
                    status_to_str(expected_status),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("conditional_update: {e}")))?;

        if changed == 0 {
            // Lost the race between our read and the guarded write.
            return Err(StoreError::Conflict {
                id,
                expected: expected_status.to_string(),
            });
        }

        Ok(job)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ScanJob>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE status = ?1 ORDER BY created_at"
                ),
                params![status_to_str(status)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_by_status: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => jobs.push(row_to_job(&row)?),
                Ok(None) => break,
                Err(e) => return Err(StoreError::Query(format!("list_by_status: {e}"))),
            }
        }
        Ok(jobs)
    }
}
