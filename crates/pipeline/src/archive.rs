//! Archive coordinator: demote free-tier results to archival storage.

use async_trait::async_trait;
use tracing::{error, info, warn};

use tierflow_core::{ArchiveEvalMessage, ServiceTier, StorageClass};
use tierflow_events::{ReceivedMessage, decode_body};
use tierflow_infra::{ObjectStore, ObjectStoreError, ProfileDirectory};

use crate::poller::{MessageHandler, Outcome};

pub struct ArchiveCoordinator<P, O> {
    profiles: P,
    objects: O,
}

impl<P, O> ArchiveCoordinator<P, O>
where
    P: ProfileDirectory,
    O: ObjectStore,
{
    pub fn new(profiles: P, objects: O) -> Self {
        Self { profiles, objects }
    }

    async fn evaluate(&self, message: ArchiveEvalMessage) -> Outcome {
        let job_id = &message.job_id;
        let tier = match self.profiles.tier(&message.user_id).await {
            Ok(tier) => tier,
            Err(e) => {
                error!(job_id = %job_id, user_id = %message.user_id, error = %e, "profile lookup failed");
                return Outcome::Retry;
            }
        };

        if tier == ServiceTier::Premium {
            info!(job_id = %job_id, "premium user; result stays hot");
            return Outcome::Complete;
        }

        let result = message.result();
        match self
            .objects
            .set_storage_class(&result, StorageClass::Archival)
            .await
        {
            Ok(()) => {
                info!(job_id = %job_id, %result, "result archived");
                Outcome::Complete
            }
            Err(ObjectStoreError::NotFound(object)) => {
                warn!(job_id = %job_id, %object, "result object is gone; nothing to archive");
                Outcome::Discard
            }
            // Already out of hot storage, e.g. a restore is under way.
            Err(ObjectStoreError::InvalidObjectState { object, reason }) => {
                info!(job_id = %job_id, %object, %reason, "result not demotable; leaving it");
                Outcome::Complete
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to archive result");
                Outcome::Retry
            }
        }
    }
}

#[async_trait]
impl<P, O> MessageHandler for ArchiveCoordinator<P, O>
where
    P: ProfileDirectory,
    O: ObjectStore,
{
    async fn handle(&self, message: &ReceivedMessage) -> Outcome {
        match decode_body::<ArchiveEvalMessage>(&message.body) {
            Ok(m) => self.evaluate(m).await,
            Err(e) => {
                warn!(receipt = %message.receipt, error = %e, "malformed archive message");
                Outcome::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tierflow_core::ObjectRef;
    use tierflow_events::ReceiptHandle;
    use tierflow_infra::{InMemoryObjectStore, InMemoryProfiles};

    fn result() -> ObjectRef {
        ObjectRef::new("results", "out/U1/J1.result")
    }

    fn message(user: &str) -> ReceivedMessage {
        let body = ArchiveEvalMessage::new("J1".parse().unwrap(), user.parse().unwrap(), &result());
        ReceivedMessage {
            receipt: ReceiptHandle::new("r1"),
            body: serde_json::to_string(&body).unwrap(),
            receive_count: 1,
        }
    }

    fn coordinator() -> (
        Arc<InMemoryObjectStore>,
        ArchiveCoordinator<InMemoryProfiles, Arc<InMemoryObjectStore>>,
    ) {
        let objects = Arc::new(InMemoryObjectStore::new());
        objects.insert(result(), "annotated", StorageClass::Hot);
        let profiles = InMemoryProfiles::new()
            .with_user("U1".parse().unwrap(), ServiceTier::Free)
            .with_user("U2".parse().unwrap(), ServiceTier::Premium);
        (Arc::clone(&objects), ArchiveCoordinator::new(profiles, objects))
    }

    #[tokio::test]
    async fn free_user_result_is_archived_once() {
        let (objects, c) = coordinator();
        assert_eq!(c.handle(&message("U1")).await, Outcome::Complete);
        assert_eq!(objects.class_of(&result()), Some(StorageClass::Archival));

        // Replay is a no-op success.
        assert_eq!(c.handle(&message("U1")).await, Outcome::Complete);
        assert_eq!(objects.class_changes().len(), 1);
    }

    #[tokio::test]
    async fn premium_user_result_stays_hot() {
        let (objects, c) = coordinator();
        assert_eq!(c.handle(&message("U2")).await, Outcome::Complete);
        assert_eq!(objects.class_of(&result()), Some(StorageClass::Hot));
    }

    #[tokio::test]
    async fn unknown_profile_is_retried() {
        let (objects, c) = coordinator();
        assert_eq!(c.handle(&message("U9")).await, Outcome::Retry);
        assert_eq!(objects.class_of(&result()), Some(StorageClass::Hot));
    }

    #[tokio::test]
    async fn restoring_result_is_left_alone() {
        let (objects, c) = coordinator();
        objects.insert(result(), "annotated", StorageClass::Restoring);
        assert_eq!(c.handle(&message("U1")).await, Outcome::Complete);
        assert_eq!(objects.class_of(&result()), Some(StorageClass::Restoring));
        assert!(objects.class_changes().is_empty());
    }

    #[tokio::test]
    async fn missing_result_is_dropped() {
        let (objects, c) = coordinator();
        tierflow_infra::ObjectStore::delete(&*objects, &result())
            .await
            .unwrap();
        assert_eq!(c.handle(&message("U1")).await, Outcome::Discard);
    }
}
