//! Bridge — mirrors terminal scan jobs into the external platform's records.
//!
//! Jobs with `origin = external_platform` are upserted (keyed by job id) into
//! the platform's own record shape whenever they reach a terminal state.
//! Sync failures never revert the job's terminal state; the upsert is
//! idempotent so re-running it for the same job yields the same single
//! record.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::job::model::{JobStatus, ScanAlert, ScanJob, ScanSummary};

/// The external platform's scan record shape (camelCase is theirs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalScanRecord {
    pub job_id: Uuid,
    pub owner_ref: String,
    pub target_url: String,
    /// External status vocabulary: "completed" or "failed".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ScanSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub alerts: Vec<ScanAlert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Map a terminal job into the external record. The platform collapses
/// cancelled into failed.
pub fn to_external_record(job: &ScanJob) -> ExternalScanRecord {
    let status = match job.status {
        JobStatus::Completed => "completed",
        _ => "failed",
    };

    ExternalScanRecord {
        job_id: job.id,
        owner_ref: job.owner_ref.clone(),
        target_url: job.config.target.clone(),
        status: status.to_string(),
        results: job.result.as_ref().map(|r| r.summary),
        alerts: job
            .result
            .as_ref()
            .map(|r| r.alerts.clone())
            .unwrap_or_default(),
        error_message: job.error.as_ref().map(|e| e.message.clone()),
        updated_at: job.updated_at,
    }
}

/// Upsert-by-key sink for external scan records.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    /// Insert or replace the record keyed by its job id.
    async fn upsert(&self, record: &ExternalScanRecord) -> Result<(), BridgeError>;
}

/// HTTP upsert target: PUT {endpoint}/{job_id}.
pub struct HttpSyncTarget {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSyncTarget {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SyncTarget for HttpSyncTarget {
    async fn upsert(&self, record: &ExternalScanRecord) -> Result<(), BridgeError> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), record.job_id);
        let response = self
            .client
            .put(&url)
            .json(record)
            .send()
            .await
            .map_err(|e| BridgeError::UpsertFailed {
                id: record.job_id,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(BridgeError::UpsertFailed {
                id: record.job_id,
                reason: format!("HTTP {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Retrying reconciler over a sync target.
pub struct Bridge {
    target: Box<dyn SyncTarget>,
    max_attempts: u32,
    base_delay: Duration,
}

impl Bridge {
    pub fn new(target: Box<dyn SyncTarget>, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            target,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Mirror a terminal job into the external platform. Retries transient
    /// failures with exponential backoff and jitter; the final failure is
    /// reported but must not affect the job record itself.
    pub async fn sync(&self, job: &ScanJob) -> Result<(), BridgeError> {
        debug_assert!(job.status.is_terminal());

        let record = to_external_record(job);
        let mut delay = self.base_delay;

        for attempt in 1..=self.max_attempts {
            match self.target.upsert(&record).await {
                Ok(()) => {
                    debug!(job_id = %job.id, status = %record.status, attempt, "Synced to external platform");
                    return Ok(());
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(job_id = %job.id, attempt, error = %e, "Sync attempt failed, retrying");
                    tokio::time::sleep(with_jitter(delay)).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    warn!(job_id = %job.id, attempts = self.max_attempts, error = %e, "Sync gave up");
                    return Err(BridgeError::RetriesExhausted {
                        id: job.id,
                        attempts: self.max_attempts,
                    });
                }
            }
        }

        unreachable!("loop returns on the final attempt");
    }
}

/// Add up to 25% random jitter so concurrent retries spread out.
fn with_jitter(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    delay.mul_f64(1.0 + jitter)
}
