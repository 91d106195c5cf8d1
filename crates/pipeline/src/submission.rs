//! Front-end-facing operations: job submission, tier upgrade, job lookup.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

use tierflow_core::keys::parse_input_key;
use tierflow_core::{
    DomainError, JobId, JobRecord, JobStatus, ObjectRef, RequestMessage, RestoreRequestMessage,
    ServiceTier, StorageClass, UserId, free_access_expired,
};
use tierflow_events::{MessageQueue, QueueError, send_json};
use tierflow_infra::{
    JobStore, JobStoreError, ObjectStore, ObjectStoreError, ProfileDirectory, ProfileError,
};

/// How long a free-tier user may download a result after completion.
pub fn default_free_access_window() -> Duration {
    Duration::minutes(5)
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} has no log yet (status {status})")]
    NotCompleted { job_id: JobId, status: JobStatus },

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Object(#[from] ObjectStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// An uploaded input awaiting registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub user_id: UserId,
    pub user_email: String,
    pub input: ObjectRef,
}

/// Register an uploaded input as a pending job and queue it for dispatch.
///
/// The input key's base name must be `<job_id>~<file_name>`.
pub async fn submit<S, Q>(
    jobs: &S,
    requests: &Q,
    submission: Submission,
    now: DateTime<Utc>,
) -> Result<JobRecord, SubmissionError>
where
    S: JobStore + ?Sized,
    Q: MessageQueue + ?Sized,
{
    let (job_id, file_name) = parse_input_key(&submission.input.key)?;
    let record = JobRecord::pending(
        job_id,
        submission.user_id,
        submission.user_email,
        file_name,
        submission.input,
        now.timestamp(),
    );

    jobs.create(&record).await?;
    send_json(requests, &RequestMessage::from_record(&record)).await?;
    info!(job_id = %record.job_id, user_id = %record.user_id, "job submitted");
    Ok(record)
}

/// Result of a tier upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeSummary {
    /// Jobs whose archived result was queued for restore.
    pub restores_requested: Vec<JobId>,
}

/// Upgrade a user to premium and queue restores for their archived results.
pub async fn upgrade<P, S, O, Q>(
    profiles: &P,
    jobs: &S,
    objects: &O,
    restore_requests: &Q,
    user_id: &UserId,
) -> Result<UpgradeSummary, SubmissionError>
where
    P: ProfileDirectory + ?Sized,
    S: JobStore + ?Sized,
    O: ObjectStore + ?Sized,
    Q: MessageQueue + ?Sized,
{
    profiles.set_tier(user_id, ServiceTier::Premium).await?;
    info!(user_id = %user_id, "user upgraded to premium");

    let mut summary = UpgradeSummary::default();
    for record in jobs.list_by_user(user_id).await? {
        if record.status != JobStatus::Completed {
            continue;
        }
        let Some(result) = record.result() else {
            continue;
        };

        match objects.storage_class(&result).await {
            Ok(StorageClass::Archival) => {}
            Ok(_) => continue,
            Err(ObjectStoreError::NotFound(object)) => {
                warn!(job_id = %record.job_id, %object, "result object is gone");
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        send_json(
            restore_requests,
            &RestoreRequestMessage::new(record.job_id.clone(), &result),
        )
        .await?;
        summary.restores_requested.push(record.job_id);
    }

    info!(
        user_id = %user_id,
        restores = summary.restores_requested.len(),
        "archived results queued for restore"
    );
    Ok(summary)
}

/// A job as shown to its owner.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub record: JobRecord,
    pub tier: ServiceTier,
    /// Free-tier download window has lapsed; the user must upgrade.
    pub download_expired: bool,
    /// The archived result is being restored and cannot be downloaded yet.
    pub restoring: bool,
}

async fn load_owned<S>(jobs: &S, requester: &UserId, job_id: &JobId) -> Result<JobRecord, SubmissionError>
where
    S: JobStore + ?Sized,
{
    let record = jobs
        .get(job_id)
        .await?
        .ok_or_else(|| SubmissionError::NotFound(job_id.clone()))?;
    record.authorize(requester)?;
    Ok(record)
}

/// Load a job on behalf of `requester`, enforcing ownership.
pub async fn job_view<S, P, O>(
    jobs: &S,
    profiles: &P,
    objects: &O,
    requester: &UserId,
    job_id: &JobId,
    now: DateTime<Utc>,
    free_window: Duration,
) -> Result<JobView, SubmissionError>
where
    S: JobStore + ?Sized,
    P: ProfileDirectory + ?Sized,
    O: ObjectStore + ?Sized,
{
    let record = load_owned(jobs, requester, job_id).await?;

    let restoring = match record.result() {
        Some(result) if record.status == JobStatus::Completed => {
            match objects.storage_class(&result).await {
                Ok(class) => class == StorageClass::Restoring,
                Err(ObjectStoreError::NotFound(_)) => false,
                Err(e) => return Err(e.into()),
            }
        }
        _ => false,
    };

    let tier = profiles.tier(requester).await?;
    let download_expired = free_access_expired(&record, tier, now, free_window);
    Ok(JobView {
        record,
        tier,
        download_expired,
        restoring,
    })
}

/// Every job owned by `user_id`, oldest submission first.
pub async fn list_jobs<S>(jobs: &S, user_id: &UserId) -> Result<Vec<JobRecord>, SubmissionError>
where
    S: JobStore + ?Sized,
{
    Ok(jobs.list_by_user(user_id).await?)
}

/// Fetch the run log of a completed job owned by `requester`.
///
/// The log is staged under `scratch` and removed once read.
pub async fn job_log<S, O>(
    jobs: &S,
    objects: &O,
    requester: &UserId,
    job_id: &JobId,
    scratch: &Path,
) -> Result<String, SubmissionError>
where
    S: JobStore + ?Sized,
    O: ObjectStore + ?Sized,
{
    let record = load_owned(jobs, requester, job_id).await?;
    let log = match (record.status, record.log()) {
        (JobStatus::Completed, Some(log)) => log,
        (status, _) => {
            return Err(SubmissionError::NotCompleted {
                job_id: job_id.clone(),
                status,
            });
        }
    };

    let staged = scratch.join(format!("{job_id}.log"));
    objects.get_to_file(&log, &staged).await?;
    let text = tokio::fs::read_to_string(&staged).await;
    if let Err(e) = tokio::fs::remove_file(&staged).await {
        warn!(path = %staged.display(), error = %e, "failed to remove staged log");
    }
    text.map_err(|e| ObjectStoreError::Io(format!("read {}: {e}", staged.display())).into())
}
