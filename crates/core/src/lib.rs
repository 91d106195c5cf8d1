//! `tierflow-core`: job lifecycle foundation types.
//!
//! This crate contains the **pure** data model shared by every pipeline
//! component: identifiers, the job record and its forward-only status machine,
//! storage-tier vocabulary, queue message schemas and object key conventions.
//! No infrastructure concerns live here.

pub mod error;
pub mod id;
pub mod job;
pub mod keys;
pub mod messages;
pub mod storage;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, UserId};
pub use job::{
    Completion, ExpectedStatus, JobRecord, JobStatus, StatusUpdate, Transition, free_access_expired,
};
pub use messages::{
    ArchiveEvalMessage, NotificationMessage, PendingRestoreMessage, RequestMessage,
    RestoreRequestMessage,
};
pub use storage::{ObjectRef, RestoreStatus, RestoreTier, ServiceTier, StorageClass};
