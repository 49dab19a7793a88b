//! Control surface — the operations callers drive jobs with.
//!
//! Thin facade over the manager and dispatcher: `start_scan` creates and
//! admits a job, `status` reads one back, `cancel` requests a stop. An outer
//! transport (HTTP, queue consumer) would sit directly on top of this.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, Error};
use crate::job::manager::JobManager;
use crate::job::model::{
    FailureKind, JobFailure, JobOrigin, JobProgress, JobStatus, ScanConfig, ScanJob, ScanResult,
};

/// Caller-facing snapshot of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<ScanJob> for JobStatusView {
    fn from(job: ScanJob) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job.progress,
            result: job.result,
            error: job.error,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

pub struct ControlSurface {
    manager: JobManager,
    dispatcher: Arc<Dispatcher>,
}

impl ControlSurface {
    pub fn new(manager: JobManager, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            manager,
            dispatcher,
        }
    }

    /// Create a job and hand it to the dispatcher. If admission is rejected
    /// the job still exists; it is failed in place so the caller can read
    /// back why it never ran.
    pub async fn start_scan(
        &self,
        config: ScanConfig,
        owner_ref: impl Into<String>,
        origin: JobOrigin,
    ) -> Result<ScanJob, Error> {
        let job = self.manager.create(config, owner_ref, origin).await?;

        match self.dispatcher.launch(job.id).await {
            Ok(()) => Ok(job),
            Err(e @ DispatchError::Backpressure { .. }) => {
                let failure = JobFailure::new(
                    FailureKind::DispatchFailed,
                    "Scan capacity exhausted, retry later",
                );
                if let Err(fe) = self.manager.fail(job.id, failure).await {
                    warn!(job_id = %job.id, error = %fe, "Could not record admission rejection");
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusView, Error> {
        Ok(self.manager.get(job_id).await?.into())
    }

    /// Request cancellation. Safe on terminal jobs (no-op) and on jobs still
    /// waiting in the queue.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), Error> {
        self.manager.request_cancel(job_id).await?;
        self.dispatcher.notify_cancel(job_id).await;
        Ok(())
    }
}
