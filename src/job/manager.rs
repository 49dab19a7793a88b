//! Job manager — owns every status mutation of scan job records.
//!
//! All writers (control surface, dispatcher, worker agent) go through the
//! manager; it validates transitions against the state machine before issuing
//! a conditional store update, so a racing terminal write loses with
//! `InvalidTransition` instead of clobbering the record.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, StoreError};
use crate::job::model::{
    JobFailure, JobOrigin, JobProgress, JobStatus, ScanConfig, ScanJob, ScanResult,
};
use crate::store::traits::{JobPatch, JobStore};

/// Phase label the worker agent writes to signal readiness while Launching.
pub const READY_PHASE: &str = "ready";

/// Validates and applies scan job state transitions.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a new Pending job. Rejects malformed configurations.
    pub async fn create(
        &self,
        config: ScanConfig,
        owner_ref: impl Into<String>,
        origin: JobOrigin,
    ) -> Result<ScanJob, JobError> {
        validate_config(&config)?;

        let job = ScanJob::new(config, owner_ref, origin);
        self.store
            .create_record(&job)
            .await
            .map_err(|source| JobError::Store { id: job.id, source })?;

        info!(job_id = %job.id, target = %job.config.target, origin = ?job.origin, "Job created");
        Ok(job)
    }

    /// Fetch a job by ID.
    pub async fn get(&self, job_id: Uuid) -> Result<ScanJob, JobError> {
        self.store
            .read_record(job_id)
            .await
            .map_err(|source| JobError::Store { id: job_id, source })?
            .ok_or(JobError::NotFound { id: job_id })
    }

    /// Pending → Launching. Idempotent no-op if already Launching.
    pub async fn transition_to_launching(&self, job_id: Uuid) -> Result<ScanJob, JobError> {
        let job = self.get(job_id).await?;
        if job.status == JobStatus::Launching {
            return Ok(job);
        }
        self.transition(job_id, JobStatus::Pending, JobStatus::Launching, JobPatch::default())
            .await
    }

    /// Launching → Running. Records `started_at`.
    pub async fn transition_to_running(&self, job_id: Uuid) -> Result<ScanJob, JobError> {
        self.transition(
            job_id,
            JobStatus::Launching,
            JobStatus::Running,
            JobPatch::default().with_started_at(Utc::now()),
        )
        .await
    }

    /// Record the runtime handle of the dispatched worker. Metadata only;
    /// does not touch status.
    pub async fn record_worker_ref(&self, job_id: Uuid, worker_ref: &str) -> Result<(), JobError> {
        let job = self.get(job_id).await?;
        let patch = JobPatch {
            worker_ref: Some(worker_ref.to_string()),
            ..Default::default()
        };
        self.store
            .conditional_update(job_id, job.status, patch)
            .await
            .map_err(|source| self.map_store_error(job_id, source, job.status, job.status))?;
        Ok(())
    }

    /// Worker-side readiness marker: stamps `progress.phase = "ready"` while
    /// the job is still Launching. The dispatcher polls for this before
    /// moving the job to Running.
    pub async fn signal_ready(&self, job_id: Uuid) -> Result<(), JobError> {
        let patch = JobPatch::progress(JobProgress::new(READY_PHASE, 0, "Scanner initialised"));
        self.store
            .conditional_update(job_id, JobStatus::Launching, patch)
            .await
            .map_err(|source| {
                self.map_store_error(job_id, source, JobStatus::Launching, JobStatus::Launching)
            })?;
        debug!(job_id = %job_id, "Worker signalled ready");
        Ok(())
    }

    /// Update progress. Legal only while Running.
    pub async fn update_progress(
        &self,
        job_id: Uuid,
        progress: JobProgress,
    ) -> Result<(), JobError> {
        self.store
            .conditional_update(job_id, JobStatus::Running, JobPatch::progress(progress))
            .await
            .map_err(|source| {
                self.map_store_error(job_id, source, JobStatus::Running, JobStatus::Running)
            })?;
        Ok(())
    }

    /// Running → Completed with results. Calling `complete` again with an
    /// equal result is a silent success; a differing result is rejected.
    pub async fn complete(&self, job_id: Uuid, result: ScanResult) -> Result<(), JobError> {
        let job = self.get(job_id).await?;

        if job.status == JobStatus::Completed {
            return if job.result.as_ref() == Some(&result) {
                Ok(())
            } else {
                Err(self.invalid_transition(job_id, job.status, JobStatus::Completed))
            };
        }

        let patch = JobPatch::status(JobStatus::Completed)
            .with_result(result.clone())
            .with_progress(JobProgress::new("completed", 100, "Scan complete"))
            .with_completed_at(Utc::now());

        match self
            .store
            .conditional_update(job_id, JobStatus::Running, patch)
            .await
        {
            Ok(updated) => {
                info!(
                    job_id = %job_id,
                    high = updated.result.as_ref().map(|r| r.summary.high).unwrap_or(0),
                    medium = updated.result.as_ref().map(|r| r.summary.medium).unwrap_or(0),
                    "Job completed"
                );
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => {
                // Re-read once: a concurrent identical complete is still a success.
                let current = self.get(job_id).await?;
                if current.status == JobStatus::Completed && current.result.as_ref() == Some(&result)
                {
                    Ok(())
                } else {
                    Err(self.invalid_transition(job_id, current.status, JobStatus::Completed))
                }
            }
            Err(source) => Err(JobError::Store { id: job_id, source }),
        }
    }

    /// Any non-terminal status → Failed with a classified error.
    pub async fn fail(&self, job_id: Uuid, failure: JobFailure) -> Result<(), JobError> {
        let job = self.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(self.invalid_transition(job_id, job.status, JobStatus::Failed));
        }

        let patch = JobPatch::status(JobStatus::Failed)
            .with_error(failure.clone())
            .with_progress(JobProgress::new("failed", job.progress.percent, failure.message.clone()))
            .with_completed_at(Utc::now());

        match self.store.conditional_update(job_id, job.status, patch).await {
            Ok(_) => {
                warn!(job_id = %job_id, kind = %failure.kind, message = %failure.message, "Job failed");
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => {
                // Status moved under us; retry once from the fresh state.
                let current = self.get(job_id).await?;
                if current.status.is_terminal() {
                    return Err(self.invalid_transition(job_id, current.status, JobStatus::Failed));
                }
                let patch = JobPatch::status(JobStatus::Failed)
                    .with_error(failure.clone())
                    .with_progress(JobProgress::new(
                        "failed",
                        current.progress.percent,
                        failure.message.clone(),
                    ))
                    .with_completed_at(Utc::now());
                self.store
                    .conditional_update(job_id, current.status, patch)
                    .await
                    .map_err(|source| {
                        self.map_store_error(job_id, source, current.status, JobStatus::Failed)
                    })?;
                warn!(job_id = %job_id, kind = %failure.kind, "Job failed (after retry)");
                Ok(())
            }
            Err(source) => Err(JobError::Store { id: job_id, source }),
        }
    }

    /// Request cancellation. Terminal jobs return success as a no-op; the flag
    /// is never cleared once set.
    pub async fn request_cancel(&self, job_id: Uuid) -> Result<(), JobError> {
        let job = self.get(job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }
        if job.cancel_requested {
            return Ok(());
        }

        let patch = JobPatch {
            cancel_requested: Some(true),
            ..Default::default()
        };
        match self.store.conditional_update(job_id, job.status, patch).await {
            Ok(_) => {
                info!(job_id = %job_id, "Cancellation requested");
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => {
                // Status changed under us. If it went terminal, the cancel is moot.
                let current = self.get(job_id).await?;
                if current.status.is_terminal() {
                    return Ok(());
                }
                let patch = JobPatch {
                    cancel_requested: Some(true),
                    ..Default::default()
                };
                self.store
                    .conditional_update(job_id, current.status, patch)
                    .await
                    .map_err(|source| {
                        self.map_store_error(job_id, source, current.status, current.status)
                    })?;
                Ok(())
            }
            Err(source) => Err(JobError::Store { id: job_id, source }),
        }
    }

    /// Non-terminal → Cancelled. Called only by the dispatcher after the
    /// worker is confirmed stopped.
    pub async fn mark_cancelled(&self, job_id: Uuid) -> Result<(), JobError> {
        let job = self.get(job_id).await?;
        if job.status == JobStatus::Cancelled {
            return Ok(());
        }
        if job.status.is_terminal() {
            // Natural completion or failure won the race.
            return Err(self.invalid_transition(job_id, job.status, JobStatus::Cancelled));
        }

        let patch = JobPatch::status(JobStatus::Cancelled)
            .with_progress(JobProgress::new("cancelled", job.progress.percent, "Scan cancelled"))
            .with_completed_at(Utc::now());
        self.store
            .conditional_update(job_id, job.status, patch)
            .await
            .map_err(|source| {
                self.map_store_error(job_id, source, job.status, JobStatus::Cancelled)
            })?;
        info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    /// Validated transition helper for the simple launch-path moves.
    async fn transition(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        target: JobStatus,
        extra: JobPatch,
    ) -> Result<ScanJob, JobError> {
        debug_assert!(expected.can_transition_to(target));

        let patch = JobPatch {
            status: Some(target),
            ..extra
        };
        let updated = self
            .store
            .conditional_update(job_id, expected, patch)
            .await
            .map_err(|source| self.map_store_error(job_id, source, expected, target))?;

        debug!(job_id = %job_id, from = %expected, to = %target, "Job transitioned");
        Ok(updated)
    }

    fn invalid_transition(&self, id: Uuid, state: JobStatus, target: JobStatus) -> JobError {
        JobError::InvalidTransition {
            id,
            state: state.to_string(),
            target: target.to_string(),
        }
    }

    fn map_store_error(
        &self,
        id: Uuid,
        source: StoreError,
        expected: JobStatus,
        target: JobStatus,
    ) -> JobError {
        match source {
            StoreError::NotFound(_) => JobError::NotFound { id },
            StoreError::Conflict { .. } => self.invalid_transition(id, expected, target),
            other => JobError::Store { id, source: other },
        }
    }
}

/// Check a scan configuration before accepting a job.
fn validate_config(config: &ScanConfig) -> Result<(), JobError> {
    let target = config.target.trim();
    if target.is_empty() {
        return Err(JobError::InvalidConfig {
            reason: "target is empty".to_string(),
        });
    }

    let rest = target
        .strip_prefix("https://")
        .or_else(|| target.strip_prefix("http://"))
        .ok_or_else(|| JobError::InvalidConfig {
            reason: format!("target {target} must use http or https"),
        })?;

    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    if host.is_empty() {
        return Err(JobError::InvalidConfig {
            reason: format!("target {target} has no host"),
        });
    }

    Ok(())
}
