//! Job record and its forward-only status machine.
//!
//! A record moves `PENDING → RUNNING → COMPLETED`. The only step back is
//! [`StatusUpdate::Release`], which hands a claim back to `PENDING` when the
//! compute worker could not be launched. Every transition is expressed as a
//! [`StatusUpdate`] guarded by an [`ExpectedStatus`]; stores apply it as a
//! compare-and-swap and report a failed precondition as
//! [`Transition::Skipped`] rather than as an error.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, UserId};
use crate::storage::{ObjectRef, ServiceTier};

/// Lifecycle status of a job. Persisted as `PENDING|RUNNING|COMPLETED`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
        }
    }

    /// The only status a record may be in immediately before this one.
    pub fn predecessor(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Pending => None,
            JobStatus::Running => Some(JobStatus::Pending),
            JobStatus::Completed => Some(JobStatus::Running),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// Precondition on the current status of a record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExpectedStatus(pub JobStatus);

impl ExpectedStatus {
    pub fn matches(self, actual: JobStatus) -> bool {
        self.0 == actual
    }
}

/// Fields recorded when a job completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub result_bucket: String,
    pub result_key: String,
    pub log_key: String,
    /// Epoch seconds.
    pub complete_time: i64,
}

/// A forward transition of the status machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// `PENDING → RUNNING`, applied by the dispatcher.
    Start,
    /// `RUNNING → COMPLETED`, applied by the completion path.
    Complete(Completion),
    /// `RUNNING → PENDING`, applied by the dispatcher when the launch that
    /// followed its claim failed.
    Release,
}

impl StatusUpdate {
    pub fn target(&self) -> JobStatus {
        match self {
            StatusUpdate::Start => JobStatus::Running,
            StatusUpdate::Complete(_) => JobStatus::Completed,
            StatusUpdate::Release => JobStatus::Pending,
        }
    }

    pub fn expected(&self) -> ExpectedStatus {
        match self {
            StatusUpdate::Start => ExpectedStatus(JobStatus::Pending),
            StatusUpdate::Complete(_) | StatusUpdate::Release => {
                ExpectedStatus(JobStatus::Running)
            }
        }
    }
}

/// Result of a conditional status write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The precondition held and the record moved forward.
    Applied,
    /// The precondition failed; nothing was written. `current` is `None` when
    /// the record does not exist.
    Skipped { current: Option<JobStatus> },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// One submitted job. Field names are the persisted/wire names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub user_id: UserId,
    pub user_email: String,
    pub file_name: String,
    pub input_bucket: String,
    pub input_key: String,
    /// Epoch seconds.
    pub submit_time: i64,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<i64>,
}

impl JobRecord {
    /// Create a freshly submitted (pending) record.
    pub fn pending(
        job_id: JobId,
        user_id: UserId,
        user_email: impl Into<String>,
        file_name: impl Into<String>,
        input: ObjectRef,
        submit_time: i64,
    ) -> Self {
        Self {
            job_id,
            user_id,
            user_email: user_email.into(),
            file_name: file_name.into(),
            input_bucket: input.bucket,
            input_key: input.key,
            submit_time,
            status: JobStatus::Pending,
            result_bucket: None,
            result_key: None,
            log_key: None,
            complete_time: None,
        }
    }

    pub fn input(&self) -> ObjectRef {
        ObjectRef::new(self.input_bucket.clone(), self.input_key.clone())
    }

    /// Result object, once the job has completed.
    pub fn result(&self) -> Option<ObjectRef> {
        match (&self.result_bucket, &self.result_key) {
            (Some(bucket), Some(key)) => Some(ObjectRef::new(bucket.clone(), key.clone())),
            _ => None,
        }
    }

    /// Run log, stored next to the result.
    pub fn log(&self) -> Option<ObjectRef> {
        match (&self.result_bucket, &self.log_key) {
            (Some(bucket), Some(key)) => Some(ObjectRef::new(bucket.clone(), key.clone())),
            _ => None,
        }
    }

    /// Apply a status update in place if its precondition holds.
    ///
    /// This is the reference semantics every `JobStore` backend must match.
    pub fn apply(&mut self, update: &StatusUpdate) -> Transition {
        if !update.expected().matches(self.status) {
            return Transition::Skipped {
                current: Some(self.status),
            };
        }

        self.status = update.target();
        if let StatusUpdate::Complete(c) = update {
            self.result_bucket = Some(c.result_bucket.clone());
            self.result_key = Some(c.result_key.clone());
            self.log_key = Some(c.log_key.clone());
            self.complete_time = Some(c.complete_time);
        }
        Transition::Applied
    }

    /// Return the record only if `requester` owns it.
    pub fn authorize(&self, requester: &UserId) -> DomainResult<&Self> {
        if &self.user_id == requester {
            Ok(self)
        } else {
            Err(DomainError::AccessDenied)
        }
    }
}

/// Whether a free-tier user's download window for a completed job has lapsed.
///
/// Premium users never expire; jobs that are not complete never expire.
pub fn free_access_expired(
    record: &JobRecord,
    tier: ServiceTier,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    if tier != ServiceTier::Free {
        return false;
    }
    match record.complete_time {
        Some(completed) if record.status == JobStatus::Completed => {
            now.timestamp() - completed > window.num_seconds()
        }
        _ => false,
    }
}
