//! Object storage with storage classes and archival restore.
//!
//! ## Class transitions
//!
//! - `Hot → Archival`: demotion (copy in place). Demoting an archival object
//!   is a no-op.
//! - `Archival → Restoring`: an accepted restore request. Requesting a
//!   restore while one is in flight (or finished) is accepted again.
//! - `Restoring → Hot`: promotion once the restore has completed. Promoting a
//!   hot object is a no-op.
//!
//! A hot object reports its restore status as `Completed`: it is readable
//! and there is nothing to wait for.

pub mod in_memory;
pub mod local;
pub mod r#trait;

pub use in_memory::InMemoryObjectStore;
pub use local::{LocalObjectStore, RestoreTimings};
pub use r#trait::{ObjectStore, ObjectStoreError};
