//! Filesystem-backed object store.
//!
//! Layout under the root directory:
//!
//! - `<root>/<bucket>/<key>`: object bytes
//! - `<root>/.meta/<bucket>/<key>.json`: storage class and restore state
//!
//! An object without a sidecar is hot. Restores complete once wall-clock time
//! passes the ready time computed from the requested tier.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use tierflow_core::{ObjectRef, RestoreStatus, RestoreTier, StorageClass};

use super::r#trait::{ObjectStore, ObjectStoreError, next_class};

const META_DIR: &str = ".meta";

/// Time each restore tier takes to complete. `None` marks a tier as
/// unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTimings {
    pub expedited: Option<Duration>,
    pub standard: Option<Duration>,
    pub bulk: Option<Duration>,
}

impl Default for RestoreTimings {
    fn default() -> Self {
        Self {
            expedited: Some(Duration::minutes(1)),
            standard: Some(Duration::minutes(5)),
            bulk: Some(Duration::hours(1)),
        }
    }
}

impl RestoreTimings {
    fn for_tier(&self, tier: RestoreTier) -> Option<Duration> {
        match tier {
            RestoreTier::Expedited => self.expedited,
            RestoreTier::Standard => self.standard,
            RestoreTier::Bulk => self.bulk,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RestoreRecord {
    tier: RestoreTier,
    days: u32,
    requested_at: DateTime<Utc>,
    ready_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    class: StorageClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    restore: Option<RestoreRecord>,
}

impl Metadata {
    fn hot() -> Self {
        Self {
            class: StorageClass::Hot,
            restore: None,
        }
    }

    fn restore_complete(&self, now: DateTime<Utc>) -> bool {
        self.restore.as_ref().is_some_and(|r| r.ready_at <= now)
    }
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    timings: RestoreTimings,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timings: RestoreTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: RestoreTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, object: &ObjectRef) -> Result<PathBuf, ObjectStoreError> {
        Ok(self.root.join(relative_path(object)?))
    }

    fn meta_path(&self, object: &ObjectRef) -> Result<PathBuf, ObjectStoreError> {
        let mut path = self.root.join(META_DIR).join(relative_path(object)?);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".json");
        path.set_file_name(name);
        Ok(path)
    }

    async fn ensure_exists(&self, object: &ObjectRef) -> Result<(), ObjectStoreError> {
        let exists = tokio::fs::try_exists(self.data_path(object)?)
            .await
            .map_err(io_error)?;
        if exists {
            Ok(())
        } else {
            Err(ObjectStoreError::NotFound(object.clone()))
        }
    }

    async fn load_meta(&self, object: &ObjectRef) -> Result<Metadata, ObjectStoreError> {
        self.ensure_exists(object).await?;
        match tokio::fs::read(self.meta_path(object)?).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ObjectStoreError::Corrupt(format!("{object}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::hot()),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn store_meta(&self, object: &ObjectRef, meta: &Metadata) -> Result<(), ObjectStoreError> {
        let path = self.meta_path(object)?;
        if meta.class == StorageClass::Hot {
            return remove_if_exists(&path).await;
        }
        let bytes = serde_json::to_vec_pretty(meta)
            .map_err(|e| ObjectStoreError::Corrupt(e.to_string()))?;
        write_atomically(&path, &bytes).await
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    #[instrument(skip(self, source), fields(object = %object), err)]
    async fn put_file(&self, object: &ObjectRef, source: &Path) -> Result<(), ObjectStoreError> {
        let dest = self.data_path(object)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::copy(source, &dest).await.map_err(io_error)?;
        remove_if_exists(&self.meta_path(object)?).await
    }

    #[instrument(skip(self, dest), fields(object = %object), err)]
    async fn get_to_file(&self, object: &ObjectRef, dest: &Path) -> Result<(), ObjectStoreError> {
        let meta = self.load_meta(object).await?;
        let readable = meta.class == StorageClass::Hot || meta.restore_complete(Utc::now());
        if !readable {
            return Err(ObjectStoreError::invalid_state(object, "object is archived"));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::copy(self.data_path(object)?, dest)
            .await
            .map_err(io_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(object = %object), err)]
    async fn delete(&self, object: &ObjectRef) -> Result<(), ObjectStoreError> {
        remove_if_exists(&self.data_path(object)?).await?;
        remove_if_exists(&self.meta_path(object)?).await
    }

    async fn storage_class(&self, object: &ObjectRef) -> Result<StorageClass, ObjectStoreError> {
        Ok(self.load_meta(object).await?.class)
    }

    #[instrument(skip(self), fields(object = %object, class = %class), err)]
    async fn set_storage_class(
        &self,
        object: &ObjectRef,
        class: StorageClass,
    ) -> Result<(), ObjectStoreError> {
        let meta = self.load_meta(object).await?;
        let complete = meta.restore_complete(Utc::now());
        match next_class(object, meta.class, complete, class)? {
            Some(next) => {
                debug!(from = %meta.class, to = %next, "changing storage class");
                self.store_meta(
                    object,
                    &Metadata {
                        class: next,
                        restore: None,
                    },
                )
                .await
            }
            None => Ok(()),
        }
    }

    #[instrument(skip(self), fields(object = %object, tier = %tier), err)]
    async fn restore(
        &self,
        object: &ObjectRef,
        tier: RestoreTier,
        days: u32,
    ) -> Result<(), ObjectStoreError> {
        let latency = self
            .timings
            .for_tier(tier)
            .ok_or(ObjectStoreError::TierUnavailable(tier))?;

        let meta = self.load_meta(object).await?;
        match meta.class {
            StorageClass::Hot => Err(ObjectStoreError::NotArchived(object.clone())),
            StorageClass::Restoring => Ok(()),
            StorageClass::Archival => {
                let now = Utc::now();
                self.store_meta(
                    object,
                    &Metadata {
                        class: StorageClass::Restoring,
                        restore: Some(RestoreRecord {
                            tier,
                            days,
                            requested_at: now,
                            ready_at: now + latency,
                        }),
                    },
                )
                .await
            }
        }
    }

    async fn restore_status(&self, object: &ObjectRef) -> Result<RestoreStatus, ObjectStoreError> {
        let meta = self.load_meta(object).await?;
        Ok(match meta.class {
            StorageClass::Hot => RestoreStatus::Completed,
            StorageClass::Archival => RestoreStatus::NotRequested,
            StorageClass::Restoring if meta.restore_complete(Utc::now()) => {
                RestoreStatus::Completed
            }
            StorageClass::Restoring => RestoreStatus::InProgress,
        })
    }
}

/// `<bucket>/<key>` as a relative path, rejecting anything that could escape
/// the root.
fn relative_path(object: &ObjectRef) -> Result<PathBuf, ObjectStoreError> {
    let joined = PathBuf::from(&object.bucket).join(&object.key);
    let valid = !object.bucket.is_empty()
        && !object.key.is_empty()
        && object.bucket != META_DIR
        && joined
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(joined)
    } else {
        Err(ObjectStoreError::InvalidKey(object.to_string()))
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ObjectStoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, bytes).await.map_err(io_error)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error)
}

async fn remove_if_exists(path: &Path) -> Result<(), ObjectStoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(e)),
    }
}

fn io_error(e: std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Io(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> ObjectRef {
        ObjectRef::new("results", "out/U1/J1.result")
    }

    async fn seeded(timings: RestoreTimings) -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("store")).with_timings(timings);
        let src = dir.path().join("src.txt");
        tokio::fs::write(&src, b"annotated").await.unwrap();
        store.put_file(&object(), &src).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_and_get_round_trip() {
        let (dir, store) = seeded(RestoreTimings::default()).await;
        let dest = dir.path().join("dl/J1.result");
        store.get_to_file(&object(), &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"annotated");
        assert_eq!(store.storage_class(&object()).await.unwrap(), StorageClass::Hot);
    }

    #[tokio::test]
    async fn archive_restore_promote_cycle() {
        let timings = RestoreTimings {
            expedited: None,
            standard: Some(Duration::zero()),
            bulk: None,
        };
        let (_dir, store) = seeded(timings).await;

        store
            .set_storage_class(&object(), StorageClass::Archival)
            .await
            .unwrap();
        assert_eq!(
            store.storage_class(&object()).await.unwrap(),
            StorageClass::Archival
        );

        assert!(matches!(
            store.restore(&object(), RestoreTier::Expedited, 1).await,
            Err(ObjectStoreError::TierUnavailable(RestoreTier::Expedited))
        ));
        store
            .restore(&object(), RestoreTier::Standard, 1)
            .await
            .unwrap();
        assert_eq!(
            store.restore_status(&object()).await.unwrap(),
            RestoreStatus::Completed
        );

        store
            .set_storage_class(&object(), StorageClass::Hot)
            .await
            .unwrap();
        assert_eq!(store.storage_class(&object()).await.unwrap(), StorageClass::Hot);
        assert!(!store.meta_path(&object()).unwrap().exists());
    }

    #[tokio::test]
    async fn slow_restore_reports_in_progress() {
        let (_dir, store) = seeded(RestoreTimings::default()).await;
        store
            .set_storage_class(&object(), StorageClass::Archival)
            .await
            .unwrap();
        store
            .restore(&object(), RestoreTier::Standard, 1)
            .await
            .unwrap();
        assert_eq!(
            store.restore_status(&object()).await.unwrap(),
            RestoreStatus::InProgress
        );
        assert!(
            store
                .set_storage_class(&object(), StorageClass::Hot)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn missing_objects_and_bad_keys() {
        let (_dir, store) = seeded(RestoreTimings::default()).await;
        let missing = ObjectRef::new("results", "nope");
        assert!(matches!(
            store.storage_class(&missing).await,
            Err(ObjectStoreError::NotFound(_))
        ));
        store.delete(&missing).await.unwrap();

        let escape = ObjectRef::new("results", "../../etc/passwd");
        assert!(matches!(
            store.storage_class(&escape).await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
    }
}
