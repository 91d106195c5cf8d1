//! Restore coordinator: start archival restores and hand them to the thaw poller.

use async_trait::async_trait;
use tracing::{error, info, warn};

use tierflow_core::{RestoreRequestMessage, RestoreTier};
use tierflow_events::{MessageQueue, ReceivedMessage, decode_body, send_json};
use tierflow_infra::{ObjectStore, ObjectStoreError};

use crate::poller::{MessageHandler, Outcome};

/// Restore retention used when none is configured.
pub const DEFAULT_RESTORE_DAYS: u32 = 1;

pub struct RestoreCoordinator<O, Q> {
    objects: O,
    pending_restores: Q,
    days: u32,
}

impl<O, Q> RestoreCoordinator<O, Q>
where
    O: ObjectStore,
    Q: MessageQueue,
{
    pub fn new(objects: O, pending_restores: Q) -> Self {
        Self {
            objects,
            pending_restores,
            days: DEFAULT_RESTORE_DAYS,
        }
    }

    pub fn with_days(mut self, days: u32) -> Self {
        self.days = days.max(1);
        self
    }

    /// Expedited first; standard whenever the expedited request is refused
    /// for any reason other than the object itself.
    async fn request_restore(
        &self,
        message: &RestoreRequestMessage,
    ) -> Result<RestoreTier, ObjectStoreError> {
        let result = message.result();
        match self
            .objects
            .restore(&result, RestoreTier::Expedited, self.days)
            .await
        {
            Ok(()) => Ok(RestoreTier::Expedited),
            Err(e @ (ObjectStoreError::NotFound(_) | ObjectStoreError::NotArchived(_))) => Err(e),
            Err(e) => {
                warn!(job_id = %message.job_id, error = %e, "expedited restore refused; using standard");
                self.objects
                    .restore(&result, RestoreTier::Standard, self.days)
                    .await
                    .map(|()| RestoreTier::Standard)
            }
        }
    }

    async fn restore(&self, message: RestoreRequestMessage) -> Outcome {
        let job_id = &message.job_id;
        match self.request_restore(&message).await {
            Ok(tier) => info!(job_id = %job_id, %tier, "restore requested"),
            Err(ObjectStoreError::NotArchived(object)) => {
                info!(job_id = %job_id, %object, "object is not archived; nothing to restore");
                return Outcome::Discard;
            }
            Err(ObjectStoreError::NotFound(object)) => {
                warn!(job_id = %job_id, %object, "object is gone; nothing to restore");
                return Outcome::Discard;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "restore request failed");
                return Outcome::Retry;
            }
        }

        match send_json(&self.pending_restores, &message.pending()).await {
            Ok(()) => Outcome::Complete,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to enqueue pending restore");
                Outcome::Retry
            }
        }
    }
}

#[async_trait]
impl<O, Q> MessageHandler for RestoreCoordinator<O, Q>
where
    O: ObjectStore,
    Q: MessageQueue,
{
    async fn handle(&self, message: &ReceivedMessage) -> Outcome {
        match decode_body::<RestoreRequestMessage>(&message.body) {
            Ok(m) => self.restore(m).await,
            Err(e) => {
                warn!(receipt = %message.receipt, error = %e, "malformed restore request");
                Outcome::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use tierflow_core::{ObjectRef, PendingRestoreMessage, RestoreStatus, StorageClass};
    use tierflow_events::{InMemoryQueue, ReceiptHandle};
    use tierflow_infra::InMemoryObjectStore;

    fn result() -> ObjectRef {
        ObjectRef::new("results", "out/U1/J1.result")
    }

    fn message() -> ReceivedMessage {
        let body = RestoreRequestMessage::new("J1".parse().unwrap(), &result());
        ReceivedMessage {
            receipt: ReceiptHandle::new("r1"),
            body: serde_json::to_string(&body).unwrap(),
            receive_count: 1,
        }
    }

    fn setup(
        class: StorageClass,
    ) -> (
        Arc<InMemoryObjectStore>,
        Arc<InMemoryQueue>,
        RestoreCoordinator<Arc<InMemoryObjectStore>, Arc<InMemoryQueue>>,
    ) {
        let objects = Arc::new(InMemoryObjectStore::new());
        objects.insert(result(), "annotated", class);
        let pending = Arc::new(InMemoryQueue::new("pending-restores"));
        let c = RestoreCoordinator::new(Arc::clone(&objects), Arc::clone(&pending));
        (objects, pending, c)
    }

    #[tokio::test]
    async fn expedited_restore_enqueues_pending() {
        let (objects, pending, c) = setup(StorageClass::Archival);
        assert_eq!(c.handle(&message()).await, Outcome::Complete);

        assert_eq!(objects.restore_requests(), vec![(result(), RestoreTier::Expedited)]);
        let bodies = pending.bodies();
        assert_eq!(bodies.len(), 1);
        let m: PendingRestoreMessage = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(m.result(), result());
    }

    #[tokio::test]
    async fn expedited_rejection_falls_back_to_standard() {
        let (objects, pending, c) = setup(StorageClass::Archival);
        objects.set_reject_expedited(true);

        assert_eq!(c.handle(&message()).await, Outcome::Complete);
        assert_eq!(objects.restore_requests(), vec![(result(), RestoreTier::Standard)]);
        assert_eq!(pending.len(), 1);
    }

    /// Object store whose expedited restores fail with an I/O error.
    struct ExpeditedBroken(Arc<InMemoryObjectStore>);

    #[async_trait]
    impl ObjectStore for ExpeditedBroken {
        async fn put_file(&self, object: &ObjectRef, source: &Path) -> Result<(), ObjectStoreError> {
            self.0.put_file(object, source).await
        }

        async fn get_to_file(&self, object: &ObjectRef, dest: &Path) -> Result<(), ObjectStoreError> {
            self.0.get_to_file(object, dest).await
        }

        async fn delete(&self, object: &ObjectRef) -> Result<(), ObjectStoreError> {
            self.0.delete(object).await
        }

        async fn storage_class(&self, object: &ObjectRef) -> Result<StorageClass, ObjectStoreError> {
            self.0.storage_class(object).await
        }

        async fn set_storage_class(
            &self,
            object: &ObjectRef,
            class: StorageClass,
        ) -> Result<(), ObjectStoreError> {
            self.0.set_storage_class(object, class).await
        }

        async fn restore(
            &self,
            object: &ObjectRef,
            tier: RestoreTier,
            days: u32,
        ) -> Result<(), ObjectStoreError> {
            if tier == RestoreTier::Expedited {
                return Err(ObjectStoreError::Io("expedited request rejected".to_string()));
            }
            self.0.restore(object, tier, days).await
        }

        async fn restore_status(&self, object: &ObjectRef) -> Result<RestoreStatus, ObjectStoreError> {
            self.0.restore_status(object).await
        }
    }

    #[tokio::test]
    async fn any_expedited_failure_falls_back_to_standard() {
        let (objects, pending, _) = setup(StorageClass::Archival);
        let c = RestoreCoordinator::new(
            ExpeditedBroken(Arc::clone(&objects)),
            Arc::clone(&pending),
        );

        assert_eq!(c.handle(&message()).await, Outcome::Complete);
        assert_eq!(objects.restore_requests(), vec![(result(), RestoreTier::Standard)]);
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn hot_object_is_dropped_without_pending() {
        let (_objects, pending, c) = setup(StorageClass::Hot);
        assert_eq!(c.handle(&message()).await, Outcome::Discard);
        assert!(pending.is_empty());
    }
}
