//! Postgres-backed profile directory.
//!
//! Roles are stored as `free_user` / `premium_user`.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use tierflow_core::{ServiceTier, UserId};

use super::{ProfileDirectory, ProfileError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    user_id TEXT PRIMARY KEY,
    role    TEXT NOT NULL
);
"#;

#[derive(Debug, Clone)]
pub struct PostgresProfiles {
    pool: Arc<PgPool>,
}

impl PostgresProfiles {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn migrate(&self) -> Result<(), ProfileError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl ProfileDirectory for PostgresProfiles {
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn tier(&self, user_id: &UserId) -> Result<ServiceTier, ProfileError> {
        let row = sqlx::query("SELECT role FROM profiles WHERE user_id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tier", e))?
            .ok_or_else(|| ProfileError::NotFound(user_id.clone()))?;

        let role: String = row
            .try_get("role")
            .map_err(|e| ProfileError::Invalid(e.to_string()))?;
        role.parse()
            .map_err(|e: tierflow_core::DomainError| ProfileError::Invalid(e.to_string()))
    }

    #[instrument(skip(self), fields(user_id = %user_id, tier = tier.as_role()), err)]
    async fn set_tier(&self, user_id: &UserId, tier: ServiceTier) -> Result<(), ProfileError> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, role) VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(user_id.as_str())
        .bind(tier.as_role())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_tier", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ProfileError {
    match err {
        sqlx::Error::PoolClosed => {
            ProfileError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => ProfileError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
