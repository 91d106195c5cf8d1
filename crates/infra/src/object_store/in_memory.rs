//! In-memory object store for tests/dev.
//!
//! Restore timing is scripted: an accepted restore reports `InProgress` for a
//! configurable number of status checks, then `Completed`. Expedited restores
//! can be switched off to exercise the standard-tier fallback.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use tierflow_core::{ObjectRef, RestoreStatus, RestoreTier, StorageClass};

use super::r#trait::{ObjectStore, ObjectStoreError, next_class};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    class: StorageClass,
    /// Status checks left before an accepted restore completes.
    restore_checks_left: Option<u32>,
}

impl StoredObject {
    fn restore_complete(&self) -> bool {
        self.restore_checks_left == Some(0)
    }
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<ObjectRef, StoredObject>,
    restore_requests: Vec<(ObjectRef, RestoreTier)>,
    class_changes: Vec<(ObjectRef, StorageClass)>,
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    state: Mutex<State>,
    restore_latency: u32,
    reject_expedited: AtomicBool,
}

fn poisoned() -> ObjectStoreError {
    ObjectStoreError::Io("object store lock poisoned".to_string())
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores report `InProgress` for `checks` status queries before completing.
    pub fn with_restore_latency(mut self, checks: u32) -> Self {
        self.restore_latency = checks;
        self
    }

    pub fn set_reject_expedited(&self, reject: bool) {
        self.reject_expedited.store(reject, Ordering::SeqCst);
    }

    /// Seed an object directly in the given class.
    pub fn insert(&self, object: ObjectRef, data: impl Into<Vec<u8>>, class: StorageClass) {
        if let Ok(mut state) = self.state.lock() {
            state.objects.insert(
                object,
                StoredObject {
                    data: data.into(),
                    class,
                    restore_checks_left: None,
                },
            );
        }
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.state
            .lock()
            .map(|s| s.objects.contains_key(object))
            .unwrap_or(false)
    }

    pub fn class_of(&self, object: &ObjectRef) -> Option<StorageClass> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.objects.get(object).map(|o| o.class))
    }

    pub fn data_of(&self, object: &ObjectRef) -> Option<Vec<u8>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.objects.get(object).map(|o| o.data.clone()))
    }

    /// Every accepted restore request, in order.
    pub fn restore_requests(&self) -> Vec<(ObjectRef, RestoreTier)> {
        self.state
            .lock()
            .map(|s| s.restore_requests.clone())
            .unwrap_or_default()
    }

    /// Every class change actually performed (no-ops excluded), in order.
    pub fn class_changes(&self) -> Vec<(ObjectRef, StorageClass)> {
        self.state
            .lock()
            .map(|s| s.class_changes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_file(&self, object: &ObjectRef, source: &Path) -> Result<(), ObjectStoreError> {
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| ObjectStoreError::Io(format!("read {}: {e}", source.display())))?;
        self.insert(object.clone(), data, StorageClass::Hot);
        Ok(())
    }

    async fn get_to_file(&self, object: &ObjectRef, dest: &Path) -> Result<(), ObjectStoreError> {
        let data = {
            let state = self.state.lock().map_err(|_| poisoned())?;
            let stored = state
                .objects
                .get(object)
                .ok_or_else(|| ObjectStoreError::NotFound(object.clone()))?;
            let readable = stored.class == StorageClass::Hot || stored.restore_complete();
            if !readable {
                return Err(ObjectStoreError::invalid_state(object, "object is archived"));
            }
            stored.data.clone()
        };
        tokio::fs::write(dest, data)
            .await
            .map_err(|e| ObjectStoreError::Io(format!("write {}: {e}", dest.display())))
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.objects.remove(object);
        Ok(())
    }

    async fn storage_class(&self, object: &ObjectRef) -> Result<StorageClass, ObjectStoreError> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        state
            .objects
            .get(object)
            .map(|o| o.class)
            .ok_or_else(|| ObjectStoreError::NotFound(object.clone()))
    }

    async fn set_storage_class(
        &self,
        object: &ObjectRef,
        class: StorageClass,
    ) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let stored = state
            .objects
            .get_mut(object)
            .ok_or_else(|| ObjectStoreError::NotFound(object.clone()))?;

        if let Some(next) = next_class(object, stored.class, stored.restore_complete(), class)? {
            stored.class = next;
            stored.restore_checks_left = None;
            state.class_changes.push((object.clone(), next));
        }
        Ok(())
    }

    async fn restore(
        &self,
        object: &ObjectRef,
        tier: RestoreTier,
        _days: u32,
    ) -> Result<(), ObjectStoreError> {
        if tier == RestoreTier::Expedited && self.reject_expedited.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::TierUnavailable(tier));
        }

        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let stored = state
            .objects
            .get_mut(object)
            .ok_or_else(|| ObjectStoreError::NotFound(object.clone()))?;

        match stored.class {
            StorageClass::Hot => return Err(ObjectStoreError::NotArchived(object.clone())),
            // Already in progress or done: accepted, timing unchanged.
            StorageClass::Restoring => {}
            StorageClass::Archival => {
                stored.class = StorageClass::Restoring;
                stored.restore_checks_left = Some(self.restore_latency);
            }
        }
        state.restore_requests.push((object.clone(), tier));
        Ok(())
    }

    async fn restore_status(&self, object: &ObjectRef) -> Result<RestoreStatus, ObjectStoreError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let stored = state
            .objects
            .get_mut(object)
            .ok_or_else(|| ObjectStoreError::NotFound(object.clone()))?;

        Ok(match (stored.class, stored.restore_checks_left.as_mut()) {
            (StorageClass::Hot, _) => RestoreStatus::Completed,
            (StorageClass::Archival, _) => RestoreStatus::NotRequested,
            (StorageClass::Restoring, Some(0)) => RestoreStatus::Completed,
            (StorageClass::Restoring, Some(left)) => {
                *left -= 1;
                RestoreStatus::InProgress
            }
            (StorageClass::Restoring, None) => RestoreStatus::InProgress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> ObjectRef {
        ObjectRef::new("results", "out/U1/J1.result")
    }

    #[tokio::test]
    async fn demote_then_restore_then_promote() {
        let store = InMemoryObjectStore::new().with_restore_latency(2);
        store.insert(result(), "data", StorageClass::Hot);

        store
            .set_storage_class(&result(), StorageClass::Archival)
            .await
            .unwrap();
        assert_eq!(
            store.restore_status(&result()).await.unwrap(),
            RestoreStatus::NotRequested
        );

        store
            .restore(&result(), RestoreTier::Standard, 1)
            .await
            .unwrap();
        assert_eq!(store.restore_status(&result()).await.unwrap(), RestoreStatus::InProgress);
        assert!(
            store
                .set_storage_class(&result(), StorageClass::Hot)
                .await
                .is_err()
        );
        assert_eq!(store.restore_status(&result()).await.unwrap(), RestoreStatus::InProgress);
        assert_eq!(store.restore_status(&result()).await.unwrap(), RestoreStatus::Completed);

        store
            .set_storage_class(&result(), StorageClass::Hot)
            .await
            .unwrap();
        assert_eq!(store.class_of(&result()), Some(StorageClass::Hot));
        assert_eq!(
            store.class_changes(),
            vec![
                (result(), StorageClass::Archival),
                (result(), StorageClass::Hot)
            ]
        );
    }

    #[tokio::test]
    async fn repeated_class_changes_are_no_ops() {
        let store = InMemoryObjectStore::new();
        store.insert(result(), "data", StorageClass::Archival);

        store
            .set_storage_class(&result(), StorageClass::Archival)
            .await
            .unwrap();
        assert!(store.class_changes().is_empty());
    }

    #[tokio::test]
    async fn expedited_rejection_and_not_archived() {
        let store = InMemoryObjectStore::new();
        store.set_reject_expedited(true);
        store.insert(result(), "data", StorageClass::Archival);

        assert!(matches!(
            store.restore(&result(), RestoreTier::Expedited, 1).await,
            Err(ObjectStoreError::TierUnavailable(RestoreTier::Expedited))
        ));
        store
            .restore(&result(), RestoreTier::Standard, 1)
            .await
            .unwrap();
        // A second request while in progress is accepted.
        store
            .restore(&result(), RestoreTier::Standard, 1)
            .await
            .unwrap();

        let hot = ObjectRef::new("results", "hot");
        store.insert(hot.clone(), "x", StorageClass::Hot);
        assert!(matches!(
            store.restore(&hot, RestoreTier::Standard, 1).await,
            Err(ObjectStoreError::NotArchived(_))
        ));
    }

    #[tokio::test]
    async fn archived_objects_cannot_be_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        store.insert(result(), "data", StorageClass::Archival);

        let err = store
            .get_to_file(&result(), &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidObjectState { .. }));
    }
}
