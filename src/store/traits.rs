//! `JobStore` trait — single async interface for scan job persistence.
//!
//! Two processes write the same record (the orchestrator and the worker
//! agent), so every mutation goes through `conditional_update`: the write
//! applies only while the record is still in the expected status, and a
//! mismatch surfaces as `StoreError::Conflict`. Whichever terminal write
//! lands first wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::model::{JobFailure, JobProgress, JobStatus, ScanJob, ScanResult};

/// Partial update to a scan job record. `None` fields are left untouched;
/// `updated_at` is always advanced by the store.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<JobProgress>,
    pub result: Option<ScanResult>,
    pub error: Option<JobFailure>,
    pub cancel_requested: Option<bool>,
    pub worker_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: JobProgress) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: JobProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_result(mut self, result: ScanResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: JobFailure) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Apply a patch to an in-memory job document. Shared by store backends so
/// read-modify-write semantics stay identical across them.
pub fn apply_patch(job: &mut ScanJob, patch: &JobPatch) {
    if let Some(status) = patch.status {
        job.status = status;
    }
    if let Some(ref progress) = patch.progress {
        job.progress = progress.clone();
    }
    if let Some(ref result) = patch.result {
        job.result = Some(result.clone());
    }
    if let Some(ref error) = patch.error {
        job.error = Some(error.clone());
    }
    if let Some(cancel) = patch.cancel_requested {
        job.cancel_requested = cancel;
    }
    if let Some(ref worker_ref) = patch.worker_ref {
        job.worker_ref = Some(worker_ref.clone());
    }
    if let Some(started_at) = patch.started_at {
        job.started_at = Some(started_at);
    }
    if let Some(completed_at) = patch.completed_at {
        job.completed_at = Some(completed_at);
    }
    job.updated_at = Utc::now();
}

/// Durable, strongly-consistent per-record storage for scan jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job record.
    async fn create_record(&self, job: &ScanJob) -> Result<(), StoreError>;

    /// Fetch a job record by ID.
    async fn read_record(&self, id: Uuid) -> Result<Option<ScanJob>, StoreError>;

    /// Apply a patch only if the record is still in `expected_status`.
    /// Returns the updated record, `NotFound` if absent, or `Conflict` if the
    /// status no longer matches.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected_status: JobStatus,
        patch: JobPatch,
    ) -> Result<ScanJob, StoreError>;

    /// All records currently in `status`, oldest first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ScanJob>, StoreError>;
}
