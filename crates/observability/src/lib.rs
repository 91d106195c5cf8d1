//! Tracing and logging setup shared by the `tierflow` binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LogFormat, LogSettings, init, init_with};
