//! Job record persistence.
//!
//! All status writes are conditional: a [`StatusUpdate`](tierflow_core::StatusUpdate)
//! carries its expected current status and a store applies it only if the
//! record is still in that status. A failed precondition is reported as
//! [`Transition::Skipped`](tierflow_core::Transition), never as an error, so
//! replayed messages are harmless.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{JobStore, JobStoreError};
