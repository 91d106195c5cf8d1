//! Thaw poller: promote restored objects back to hot storage.
//!
//! Storage tier is tracked on the object only; job records are never touched
//! here.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use tierflow_core::{PendingRestoreMessage, RestoreStatus, StorageClass};
use tierflow_events::{ReceivedMessage, decode_body};
use tierflow_infra::{ObjectStore, ObjectStoreError};

use crate::poller::{MessageHandler, Outcome};

pub struct ThawPoller<O> {
    objects: O,
}

impl<O: ObjectStore> ThawPoller<O> {
    pub fn new(objects: O) -> Self {
        Self { objects }
    }

    async fn thaw(&self, message: PendingRestoreMessage) -> Outcome {
        let job_id = &message.job_id;
        let result = message.result();

        match self.objects.restore_status(&result).await {
            Ok(RestoreStatus::Completed) => {}
            Ok(status) => {
                debug!(job_id = %job_id, ?status, "restore not finished");
                return Outcome::Retry;
            }
            Err(ObjectStoreError::NotFound(object)) => {
                warn!(job_id = %job_id, %object, "restored object is gone");
                return Outcome::Discard;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "restore status query failed");
                return Outcome::Retry;
            }
        }

        match self.objects.set_storage_class(&result, StorageClass::Hot).await {
            Ok(()) => {
                info!(job_id = %job_id, %result, "result promoted to hot storage");
                Outcome::Complete
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to promote restored object");
                Outcome::Retry
            }
        }
    }
}

#[async_trait]
impl<O: ObjectStore> MessageHandler for ThawPoller<O> {
    async fn handle(&self, message: &ReceivedMessage) -> Outcome {
        match decode_body::<PendingRestoreMessage>(&message.body) {
            Ok(m) => self.thaw(m).await,
            Err(e) => {
                warn!(receipt = %message.receipt, error = %e, "malformed pending restore");
                Outcome::Retry
            }
        }
    }
}
