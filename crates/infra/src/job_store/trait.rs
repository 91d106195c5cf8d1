use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tierflow_core::{JobId, JobRecord, StatusUpdate, Transition, UserId};

#[derive(Debug, Clone, Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Key-value store of job records with compare-and-swap status writes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails if the id is taken.
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// All records owned by `user_id`, oldest submission first.
    async fn list_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Apply `update` only if the record is in `update.expected()`.
    async fn transition(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<Transition, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        (**self).create(record).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_by_user(user_id).await
    }

    async fn transition(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<Transition, JobStoreError> {
        (**self).transition(job_id, update).await
    }
}
