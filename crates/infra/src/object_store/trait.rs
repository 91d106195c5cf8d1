use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tierflow_core::{ObjectRef, RestoreStatus, RestoreTier, StorageClass};

#[derive(Debug, Clone, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectRef),

    /// The requested restore service level cannot be served right now.
    #[error("restore tier unavailable: {0}")]
    TierUnavailable(RestoreTier),

    #[error("object is not archived: {0}")]
    NotArchived(ObjectRef),

    /// The object's class does not allow the operation (e.g. reading or
    /// promoting an archived object before its restore completes).
    #[error("invalid object state for {object}: {reason}")]
    InvalidObjectState { object: ObjectRef, reason: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("object store io error: {0}")]
    Io(String),

    #[error("object metadata is corrupt: {0}")]
    Corrupt(String),
}

impl ObjectStoreError {
    pub(crate) fn invalid_state(object: &ObjectRef, reason: impl Into<String>) -> Self {
        Self::InvalidObjectState {
            object: object.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file as a hot object, replacing any existing object.
    async fn put_file(&self, object: &ObjectRef, source: &Path) -> Result<(), ObjectStoreError>;

    /// Download a readable object to a local file.
    async fn get_to_file(&self, object: &ObjectRef, dest: &Path) -> Result<(), ObjectStoreError>;

    /// Remove an object. Removing a missing object succeeds.
    async fn delete(&self, object: &ObjectRef) -> Result<(), ObjectStoreError>;

    async fn storage_class(&self, object: &ObjectRef) -> Result<StorageClass, ObjectStoreError>;

    /// Change the storage class by copying the object onto itself.
    ///
    /// Only `Hot` and `Archival` are valid targets.
    async fn set_storage_class(
        &self,
        object: &ObjectRef,
        class: StorageClass,
    ) -> Result<(), ObjectStoreError>;

    /// Request a temporary restore of an archived object for `days` days.
    async fn restore(
        &self,
        object: &ObjectRef,
        tier: RestoreTier,
        days: u32,
    ) -> Result<(), ObjectStoreError>;

    async fn restore_status(&self, object: &ObjectRef) -> Result<RestoreStatus, ObjectStoreError>;
}

#[async_trait]
impl<S> ObjectStore for Arc<S>
where
    S: ObjectStore + ?Sized,
{
    async fn put_file(&self, object: &ObjectRef, source: &Path) -> Result<(), ObjectStoreError> {
        (**self).put_file(object, source).await
    }

    async fn get_to_file(&self, object: &ObjectRef, dest: &Path) -> Result<(), ObjectStoreError> {
        (**self).get_to_file(object, dest).await
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), ObjectStoreError> {
        (**self).delete(object).await
    }

    async fn storage_class(&self, object: &ObjectRef) -> Result<StorageClass, ObjectStoreError> {
        (**self).storage_class(object).await
    }

    async fn set_storage_class(
        &self,
        object: &ObjectRef,
        class: StorageClass,
    ) -> Result<(), ObjectStoreError> {
        (**self).set_storage_class(object, class).await
    }

    async fn restore(
        &self,
        object: &ObjectRef,
        tier: RestoreTier,
        days: u32,
    ) -> Result<(), ObjectStoreError> {
        (**self).restore(object, tier, days).await
    }

    async fn restore_status(&self, object: &ObjectRef) -> Result<RestoreStatus, ObjectStoreError> {
        (**self).restore_status(object).await
    }
}

/// Class-transition rules shared by the backends.
///
/// Returns the new class, or `None` when the object is already in the
/// requested class.
pub(crate) fn next_class(
    object: &ObjectRef,
    current: StorageClass,
    restore_complete: bool,
    target: StorageClass,
) -> Result<Option<StorageClass>, ObjectStoreError> {
    match (current, target) {
        (StorageClass::Hot, StorageClass::Hot) => Ok(None),
        (StorageClass::Archival, StorageClass::Archival) => Ok(None),
        (StorageClass::Hot, StorageClass::Archival) => Ok(Some(StorageClass::Archival)),
        (StorageClass::Restoring, StorageClass::Hot) if restore_complete => {
            Ok(Some(StorageClass::Hot))
        }
        (StorageClass::Restoring, StorageClass::Hot) => Err(ObjectStoreError::invalid_state(
            object,
            "restore still in progress",
        )),
        (StorageClass::Archival, StorageClass::Hot) => Err(ObjectStoreError::invalid_state(
            object,
            "object must be restored before promotion",
        )),
        (StorageClass::Restoring, StorageClass::Archival) => Err(
            ObjectStoreError::invalid_state(object, "object is being restored"),
        ),
        (_, StorageClass::Restoring) => Err(ObjectStoreError::invalid_state(
            object,
            "restoring is not a settable class",
        )),
    }
}
