//! User profile directory (service tier lookup).

pub mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use tierflow_core::{ServiceTier, UserId};

pub use postgres::PostgresProfiles;

#[derive(Debug, Clone, Error)]
pub enum ProfileError {
    #[error("profile not found: {0}")]
    NotFound(UserId),

    #[error("profile is invalid: {0}")]
    Invalid(String),

    #[error("profile storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn tier(&self, user_id: &UserId) -> Result<ServiceTier, ProfileError>;

    /// Create or update the user's tier.
    async fn set_tier(&self, user_id: &UserId, tier: ServiceTier) -> Result<(), ProfileError>;
}

#[async_trait]
impl<P> ProfileDirectory for Arc<P>
where
    P: ProfileDirectory + ?Sized,
{
    async fn tier(&self, user_id: &UserId) -> Result<ServiceTier, ProfileError> {
        (**self).tier(user_id).await
    }

    async fn set_tier(&self, user_id: &UserId, tier: ServiceTier) -> Result<(), ProfileError> {
        (**self).set_tier(user_id, tier).await
    }
}

/// In-memory profile directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProfiles {
    tiers: RwLock<HashMap<UserId, ServiceTier>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user_id: UserId, tier: ServiceTier) -> Self {
        if let Ok(mut tiers) = self.tiers.write() {
            tiers.insert(user_id, tier);
        }
        self
    }
}

fn poisoned() -> ProfileError {
    ProfileError::Storage("profile lock poisoned".to_string())
}

#[async_trait]
impl ProfileDirectory for InMemoryProfiles {
    async fn tier(&self, user_id: &UserId) -> Result<ServiceTier, ProfileError> {
        let tiers = self.tiers.read().map_err(|_| poisoned())?;
        tiers
            .get(user_id)
            .copied()
            .ok_or_else(|| ProfileError::NotFound(user_id.clone()))
    }

    async fn set_tier(&self, user_id: &UserId, tier: ServiceTier) -> Result<(), ProfileError> {
        let mut tiers = self.tiers.write().map_err(|_| poisoned())?;
        tiers.insert(user_id.clone(), tier);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_and_upgrade() {
        let u1: UserId = "U1".parse().unwrap();
        let profiles = InMemoryProfiles::new().with_user(u1.clone(), ServiceTier::Free);

        assert_eq!(profiles.tier(&u1).await.unwrap(), ServiceTier::Free);
        profiles.set_tier(&u1, ServiceTier::Premium).await.unwrap();
        assert_eq!(profiles.tier(&u1).await.unwrap(), ServiceTier::Premium);

        let missing = profiles.tier(&"U9".parse().unwrap()).await.unwrap_err();
        assert!(matches!(missing, ProfileError::NotFound(_)));
    }
}
