//! Store-driven intake — the orchestrator's pull side.
//!
//! The control surface admits jobs synchronously, but jobs can also land in
//! the store from outside this process (the external platform's writer, a
//! prior run that queued them). The intake loop sweeps Pending records into
//! the dispatcher in creation order, and restart recovery fails records a
//! previous run left mid-flight with no supervisor.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, JobError};
use crate::job::manager::JobManager;
use crate::job::model::{FailureKind, JobFailure, JobStatus};

pub struct Intake {
    manager: JobManager,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl Intake {
    pub fn new(manager: JobManager, dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            manager,
            dispatcher,
            interval,
        }
    }

    /// Fail jobs a previous run left Launching or Running: their supervisors
    /// are gone, so nothing will ever settle them. Run once at startup,
    /// before the first sweep.
    pub async fn recover(&self) {
        for status in [JobStatus::Launching, JobStatus::Running] {
            let jobs = match self.manager.store().list_by_status(status).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(status = %status, error = %e, "Recovery scan failed");
                    continue;
                }
            };

            for job in jobs {
                warn!(job_id = %job.id, status = %status, "Failing orphaned job from a previous run");
                let failure = JobFailure::new(
                    FailureKind::DispatchFailed,
                    "Orchestrator restarted while the job was in flight",
                );
                match self.manager.fail(job.id, failure).await {
                    Ok(()) | Err(JobError::InvalidTransition { .. }) => {}
                    Err(e) => warn!(job_id = %job.id, error = %e, "Could not fail orphaned job"),
                }
            }
        }
    }

    /// One sweep: admit Pending jobs, oldest first, until the dispatcher
    /// pushes back. Returns how many were newly admitted.
    pub async fn tick(&self) -> usize {
        let jobs = match self.manager.store().list_by_status(JobStatus::Pending).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Intake sweep failed");
                return 0;
            }
        };

        let mut admitted = 0;
        for job in jobs {
            match self.dispatcher.launch(job.id).await {
                Ok(()) => {
                    debug!(job_id = %job.id, "Job admitted from store");
                    admitted += 1;
                }
                // Queued jobs stay Pending and show up again next sweep.
                Err(DispatchError::AlreadyDispatched { .. }) => {}
                // Full house: leave the rest Pending and retry later.
                Err(DispatchError::Backpressure { .. }) => break,
                Err(e) => warn!(job_id = %job.id, error = %e, "Admission failed"),
            }
        }
        admitted
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "Job intake started");
        loop {
            self.tick().await;
            tokio::time::sleep(self.interval).await;
        }
    }
}
