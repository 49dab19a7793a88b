//! In-memory `JobStore` backend for tests and single-process development.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::model::{JobStatus, ScanJob};
use crate::store::traits::{JobPatch, JobStore, apply_patch};

/// Job store backed by a process-local map. Conditional updates are serialized
/// by the write lock, giving the same winner-takes-the-terminal-write behavior
/// as the durable backend.
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<Uuid, ScanJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records (test helper).
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_record(&self, job: &ScanJob) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&job.id) {
            return Err(StoreError::Query(format!("duplicate job id {}", job.id)));
        }
        records.insert(job.id, job.clone());
        Ok(())
    }

    async fn read_record(&self, id: Uuid) -> Result<Option<ScanJob>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected_status: JobStatus,
        patch: JobPatch,
    ) -> Result<ScanJob, StoreError> {
        let mut records = self.records.write().await;
        let job = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if job.status != expected_status {
            return Err(StoreError::Conflict {
                id,
                expected: expected_status.to_string(),
            });
        }

        apply_patch(job, &patch);
        Ok(job.clone())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ScanJob>, StoreError> {
        let records = self.records.read().await;
        let mut jobs: Vec<ScanJob> = records
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}
