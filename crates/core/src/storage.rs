//! Storage-tier vocabulary shared by the archive, restore and thaw paths.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Reference to an object in the external object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl core::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Storage class of an object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    /// Immediately readable.
    Hot,
    /// Cheap; requires a restore before it can be read.
    Archival,
    /// An archival object with a restore in flight or finished but not yet
    /// promoted back to hot.
    Restoring,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Hot => "hot",
            StorageClass::Archival => "archival",
            StorageClass::Restoring => "restoring",
        }
    }
}

impl core::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service level requested for an archival restore.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreTier {
    Expedited,
    Standard,
    Bulk,
}

impl RestoreTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreTier::Expedited => "expedited",
            RestoreTier::Standard => "standard",
            RestoreTier::Bulk => "bulk",
        }
    }
}

impl core::fmt::Display for RestoreTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of an archival restore as reported by the object store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    NotRequested,
    InProgress,
    Completed,
}

/// Subscription level of a user; gates the archival policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
    Free,
    Premium,
}

impl ServiceTier {
    /// Role string as stored in the profile directory.
    pub fn as_role(&self) -> &'static str {
        match self {
            ServiceTier::Free => "free_user",
            ServiceTier::Premium => "premium_user",
        }
    }
}

impl FromStr for ServiceTier {
    type Err = DomainError;

    /// Accepts both the short (`free`) and the role (`free_user`) spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" | "free_user" => Ok(ServiceTier::Free),
            "premium" | "premium_user" => Ok(ServiceTier::Premium),
            other => Err(DomainError::validation(format!("unknown role: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_tier_accepts_role_spellings() {
        assert_eq!("free_user".parse::<ServiceTier>().unwrap(), ServiceTier::Free);
        assert_eq!("Premium".parse::<ServiceTier>().unwrap(), ServiceTier::Premium);
        assert!("gold".parse::<ServiceTier>().is_err());
    }

    #[test]
    fn object_file_name_is_last_segment() {
        assert_eq!(ObjectRef::new("b", "out/U1/J1.result").file_name(), "J1.result");
        assert_eq!(ObjectRef::new("b", "plain").file_name(), "plain");
    }
}
