//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use tierflow_core::{JobId, JobRecord, StatusUpdate, Transition, UserId};

use super::r#trait::{JobStore, JobStoreError};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&record.job_id) {
            return Err(JobStoreError::AlreadyExists(record.job_id.clone()));
        }
        jobs.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(job_id).cloned())
    }

    async fn list_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.submit_time
                .cmp(&b.submit_time)
                .then_with(|| a.job_id.as_str().cmp(b.job_id.as_str()))
        });
        Ok(result)
    }

    async fn transition(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<Transition, JobStoreError> {
        // Check and write under one lock acquisition.
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        match jobs.get_mut(job_id) {
            Some(record) => Ok(record.apply(update)),
            None => Ok(Transition::Skipped { current: None }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tierflow_core::{Completion, JobStatus, ObjectRef};

    fn record(job: &str, user: &str, submit_time: i64) -> JobRecord {
        JobRecord::pending(
            job.parse().unwrap(),
            user.parse().unwrap(),
            format!("{user}@example.com"),
            format!("{job}.vcf"),
            ObjectRef::new("inputs", format!("in/{user}/{job}~{job}.vcf")),
            submit_time,
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = InMemoryJobStore::new();
        store.create(&record("J1", "U1", 1)).await.unwrap();
        let err = store.create(&record("J1", "U1", 2)).await.unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(id) if id.as_str() == "J1"));
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let store = InMemoryJobStore::new();
        store.create(&record("J1", "U1", 1)).await.unwrap();
        let id: JobId = "J1".parse().unwrap();

        assert_eq!(
            store.transition(&id, &StatusUpdate::Start).await.unwrap(),
            Transition::Applied
        );
        assert_eq!(
            store.transition(&id, &StatusUpdate::Start).await.unwrap(),
            Transition::Skipped {
                current: Some(JobStatus::Running)
            }
        );

        let done = StatusUpdate::Complete(Completion {
            result_bucket: "results".into(),
            result_key: "out/U1/J1.result".into(),
            log_key: "out/U1/J1.vcf.count.log".into(),
            complete_time: 10,
        });
        assert!(store.transition(&id, &done).await.unwrap().is_applied());

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result_key.as_deref(), Some("out/U1/J1.result"));
    }

    #[tokio::test]
    async fn transition_on_missing_record_is_skipped() {
        let store = InMemoryJobStore::new();
        let t = store
            .transition(&"nope".parse().unwrap(), &StatusUpdate::Start)
            .await
            .unwrap();
        assert_eq!(t, Transition::Skipped { current: None });
    }

    #[tokio::test]
    async fn concurrent_starts_apply_exactly_once() {
        let store = Arc::new(InMemoryJobStore::new());
        store.create(&record("J1", "U1", 1)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition(&"J1".parse().unwrap(), &StatusUpdate::Start)
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for h in handles {
            if h.await.unwrap().is_applied() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn list_by_user_filters_and_orders() {
        let store = InMemoryJobStore::new();
        store.create(&record("J2", "U1", 20)).await.unwrap();
        store.create(&record("J1", "U1", 10)).await.unwrap();
        store.create(&record("J3", "U2", 5)).await.unwrap();

        let jobs = store.list_by_user(&"U1".parse().unwrap()).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, vec!["J1", "J2"]);
    }
}
