//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (on insert) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! Conditional writes are a single `UPDATE ... WHERE status = $expected`; the
//! row count tells whether the precondition held. No transaction is needed.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{instrument, trace};

use tierflow_core::{JobId, JobRecord, JobStatus, StatusUpdate, Transition, UserId};

use super::r#trait::{JobStore, JobStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id        TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    user_email    TEXT NOT NULL,
    file_name     TEXT NOT NULL,
    input_bucket  TEXT NOT NULL,
    input_key     TEXT NOT NULL,
    submit_time   BIGINT NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('PENDING', 'RUNNING', 'COMPLETED')),
    result_bucket TEXT,
    result_key    TEXT,
    log_key       TEXT,
    complete_time BIGINT
);
CREATE INDEX IF NOT EXISTS jobs_user_id_idx ON jobs (user_id, submit_time);
"#;

const SELECT_COLUMNS: &str = "job_id, user_id, user_email, file_name, input_bucket, input_key, \
     submit_time, status, result_bucket, result_key, log_key, complete_time";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `jobs` table and its user index if missing.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn current_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, JobStoreError> {
        let row = sqlx::query("SELECT status FROM jobs WHERE job_id = $1")
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_status", e))?;

        row.map(|r| {
            let status: String = r
                .try_get("status")
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))
        })
        .transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, record), fields(job_id = %record.job_id), err)]
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, user_id, user_email, file_name, input_bucket, input_key,
                submit_time, status, result_bucket, result_key, log_key, complete_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.job_id.as_str())
        .bind(record.user_id.as_str())
        .bind(&record.user_email)
        .bind(&record.file_name)
        .bind(&record.input_bucket)
        .bind(&record.input_key)
        .bind(record.submit_time)
        .bind(record.status.as_str())
        .bind(record.result_bucket.as_deref())
        .bind(record.result_key.as_deref())
        .bind(record.log_key.as_deref())
        .bind(record.complete_time)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(record.job_id.clone())
            } else {
                map_sqlx_error("create", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn list_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE user_id = $1 ORDER BY submit_time ASC, job_id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_user", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, target = %update.target()), err)]
    async fn transition(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<Transition, JobStoreError> {
        let expected = update.expected().0;
        let result = match update {
            StatusUpdate::Start | StatusUpdate::Release => {
                sqlx::query("UPDATE jobs SET status = $3 WHERE job_id = $1 AND status = $2")
                    .bind(job_id.as_str())
                    .bind(expected.as_str())
                    .bind(update.target().as_str())
                    .execute(&*self.pool)
                    .await
            }
            StatusUpdate::Complete(c) => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = $3, result_bucket = $4, result_key = $5,
                        log_key = $6, complete_time = $7
                    WHERE job_id = $1 AND status = $2
                    "#,
                )
                .bind(job_id.as_str())
                .bind(expected.as_str())
                .bind(update.target().as_str())
                .bind(&c.result_bucket)
                .bind(&c.result_key)
                .bind(&c.log_key)
                .bind(c.complete_time)
                .execute(&*self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("transition", e))?;

        if result.rows_affected() == 1 {
            return Ok(Transition::Applied);
        }

        let current = self.current_status(job_id).await?;
        trace!(?current, "conditional update skipped");
        Ok(Transition::Skipped { current })
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, JobStoreError> {
    let corrupt = |e: sqlx::Error| JobStoreError::Corrupt(e.to_string());

    let job_id: String = row.try_get("job_id").map_err(corrupt)?;
    let user_id: String = row.try_get("user_id").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;

    Ok(JobRecord {
        job_id: job_id
            .parse()
            .map_err(|e: tierflow_core::DomainError| JobStoreError::Corrupt(e.to_string()))?,
        user_id: user_id
            .parse()
            .map_err(|e: tierflow_core::DomainError| JobStoreError::Corrupt(e.to_string()))?,
        user_email: row.try_get("user_email").map_err(corrupt)?,
        file_name: row.try_get("file_name").map_err(corrupt)?,
        input_bucket: row.try_get("input_bucket").map_err(corrupt)?,
        input_key: row.try_get("input_key").map_err(corrupt)?,
        submit_time: row.try_get("submit_time").map_err(corrupt)?,
        status: status
            .parse()
            .map_err(|e: tierflow_core::DomainError| JobStoreError::Corrupt(e.to_string()))?,
        result_bucket: row.try_get("result_bucket").map_err(corrupt)?,
        result_key: row.try_get("result_key").map_err(corrupt)?,
        log_key: row.try_get("log_key").map_err(corrupt)?,
        complete_time: row.try_get("complete_time").map_err(corrupt)?,
    })
}

/// Map SQLx errors to `JobStoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
