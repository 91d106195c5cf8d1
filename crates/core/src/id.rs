//! Strongly-typed identifiers used across the pipeline.
//!
//! Identifiers travel through queue payloads and object keys as plain strings,
//! so both newtypes wrap a `String` and serialize as one. Deserialization goes
//! through the same validation as parsing.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

/// Identifier of the user owning a job (front-end identity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                // `~` separates the job id from the file name in input keys and
                // `/` namespaces result keys; neither may appear in an id.
                if trimmed.contains('~') || trimmed.contains('/') {
                    return Err(DomainError::invalid_id(format!(
                        "{}: contains a reserved character: {trimmed}",
                        $name
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$t> for String {
            fn from(id: $t) -> String {
                id.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(JobId, "JobId");
impl_string_newtype!(UserId, "UserId");

impl JobId {
    /// Generate a fresh job id.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer parsing explicit ids in tests for
    /// determinism.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}
