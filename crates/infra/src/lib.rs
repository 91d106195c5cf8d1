//! Infrastructure layer: job store, object store, profiles, Redis adapters.

pub mod job_store;
pub mod messaging;
pub mod object_store;
pub mod profiles;

pub use job_store::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};
pub use object_store::{
    InMemoryObjectStore, LocalObjectStore, ObjectStore, ObjectStoreError, RestoreTimings,
};
pub use profiles::{InMemoryProfiles, PostgresProfiles, ProfileDirectory, ProfileError};

#[cfg(feature = "redis")]
pub use messaging::{RedisPubSubNotifier, RedisStreamsQueue, RedisStreamsQueueConfig};
