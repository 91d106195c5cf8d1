//! Completion path: `RUNNING → COMPLETED`.
//!
//! Runs inside the compute wrapper once the worker has produced its outputs.
//! Uploads the result and log, records completion, notifies the user and asks
//! the archive coordinator to evaluate the result. A replayed completion
//! (transition skipped) uploads again and re-sends the archive evaluation,
//! but does not notify a second time.

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use tierflow_core::keys::{ResultLayout, file_stem};
use tierflow_core::{
    ArchiveEvalMessage, Completion, JobId, JobStatus, NotificationMessage, ObjectRef,
    StatusUpdate, Transition, UserId,
};
use tierflow_events::{MessageQueue, Notifier, NotifyError, QueueError, send_json};
use tierflow_infra::{JobStore, JobStoreError, ObjectStore, ObjectStoreError};

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Object(#[from] ObjectStoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub result_bucket: String,
    pub layout: ResultLayout,
}

/// Outputs of one finished compute run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedWork {
    pub job_id: JobId,
    pub user_id: UserId,
    pub user_email: String,
    /// Input file name the outputs were derived from.
    pub file_name: String,
    pub result_path: PathBuf,
    pub log_path: PathBuf,
    /// Working directory removed once reporting finishes, whatever the outcome.
    pub work_dir: Option<PathBuf>,
}

impl CompletedWork {
    /// Derive output paths from the input path the worker was given.
    ///
    /// The result replaces everything after the first `.` of the input file
    /// name with `result_suffix`; the log appends `log_suffix` to the full
    /// input file name. Both sit next to the input.
    pub fn from_input(
        job_id: JobId,
        user_id: UserId,
        user_email: impl Into<String>,
        input_path: &Path,
        result_suffix: &str,
        log_suffix: &str,
    ) -> Self {
        let dir = input_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let file_name = input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let result_path = dir.join(format!("{}{result_suffix}", file_stem(&file_name)));
        let log_path = dir.join(format!("{file_name}{log_suffix}"));

        Self {
            job_id,
            user_id,
            user_email: user_email.into(),
            file_name,
            result_path,
            log_path,
            work_dir: Some(dir).filter(|d| !d.as_os_str().is_empty()),
        }
    }
}

/// Removes the working directory on drop.
struct WorkDirGuard(Option<PathBuf>);

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.0.take() {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(path = %dir.display(), "working directory released"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "failed to release working directory"),
            }
        }
    }
}

pub struct CompletionReporter<S, O, N, Q> {
    jobs: S,
    objects: O,
    notifier: N,
    archive_queue: Q,
    config: CompletionConfig,
}

impl<S, O, N, Q> CompletionReporter<S, O, N, Q>
where
    S: JobStore,
    O: ObjectStore,
    N: Notifier,
    Q: MessageQueue,
{
    pub fn new(jobs: S, objects: O, notifier: N, archive_queue: Q, config: CompletionConfig) -> Self {
        Self {
            jobs,
            objects,
            notifier,
            archive_queue,
            config,
        }
    }

    /// Report a finished job. Returns whether this call completed the job.
    pub async fn report(&self, work: CompletedWork) -> Result<Transition, CompletionError> {
        let _guard = WorkDirGuard(work.work_dir.clone());
        let job_id = &work.job_id;

        let result = ObjectRef::new(
            self.config.result_bucket.clone(),
            self.config.layout.result_key(&work.user_id, job_id, &work.file_name),
        );
        let log = ObjectRef::new(
            self.config.result_bucket.clone(),
            self.config.layout.log_key(&work.user_id, job_id, &work.file_name),
        );
        self.objects.put_file(&result, &work.result_path).await?;
        self.objects.put_file(&log, &work.log_path).await?;
        debug!(job_id = %job_id, %result, %log, "outputs uploaded");

        let update = StatusUpdate::Complete(Completion {
            result_bucket: result.bucket.clone(),
            result_key: result.key.clone(),
            log_key: log.key.clone(),
            complete_time: Utc::now().timestamp(),
        });
        let transition = self.jobs.transition(job_id, &update).await?;

        let archive_eval = ArchiveEvalMessage::new(job_id.clone(), work.user_id.clone(), &result);

        match transition {
            Transition::Applied => info!(job_id = %job_id, "job completed"),
            Transition::Skipped {
                current: Some(JobStatus::Completed),
            } => {
                // An earlier report may have failed after the transition. The
                // archive coordinator is idempotent, so evaluation is re-sent.
                info!(job_id = %job_id, "completion already recorded; re-sending archive evaluation");
                send_json(&self.archive_queue, &archive_eval).await?;
                return Ok(transition);
            }
            Transition::Skipped { current } => {
                warn!(job_id = %job_id, ?current, "job is not running; completion not recorded");
                return Ok(transition);
            }
        }

        // Attempt both follow-ups; report the first failure.
        let notified = self
            .notifier
            .publish(&NotificationMessage::job_completed(&work.user_email, job_id))
            .await;
        let enqueued = send_json(&self.archive_queue, &archive_eval).await;

        if let Err(e) = &notified {
            warn!(job_id = %job_id, error = %e, "completion notification failed");
        }
        if let Err(e) = &enqueued {
            warn!(job_id = %job_id, error = %e, "archive evaluation enqueue failed");
        }
        notified?;
        enqueued?;
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tierflow_core::{JobRecord, StorageClass};
    use tierflow_events::{InMemoryNotifier, InMemoryQueue, ReceiptHandle, ReceivedMessage};
    use tierflow_infra::{InMemoryJobStore, InMemoryObjectStore};

    /// Queue whose sends fail while `down` is set.
    struct FlakyQueue {
        inner: InMemoryQueue,
        down: AtomicBool,
    }

    #[async_trait]
    impl MessageQueue for FlakyQueue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn send(&self, body: String) -> Result<(), QueueError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(QueueError::Connection("queue unavailable".to_string()));
            }
            self.inner.send(body).await
        }

        async fn receive(
            &self,
            max_messages: usize,
            wait: Duration,
        ) -> Result<Vec<ReceivedMessage>, QueueError> {
            self.inner.receive(max_messages, wait).await
        }

        async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
            self.inner.delete(receipt).await
        }
    }

    async fn running_job(jobs: &InMemoryJobStore) {
        let record = JobRecord::pending(
            "J1".parse().unwrap(),
            "U1".parse().unwrap(),
            "u1@example.com",
            "J1.vcf",
            ObjectRef::new("inputs", "in/U1/J1~J1.vcf"),
            1,
        );
        jobs.create(&record).await.unwrap();
        jobs.transition(&record.job_id, &StatusUpdate::Start).await.unwrap();
    }

    fn outputs(dir: &Path) -> CompletedWork {
        let job_dir = dir.join("J1");
        std::fs::create_dir_all(&job_dir).unwrap();
        let work = CompletedWork::from_input(
            "J1".parse().unwrap(),
            "U1".parse().unwrap(),
            "u1@example.com",
            &job_dir.join("J1.vcf"),
            ".annot.vcf",
            ".count.log",
        );
        std::fs::write(&work.result_path, "#annotated\n").unwrap();
        std::fs::write(&work.log_path, "count: 1\n").unwrap();
        work
    }

    #[tokio::test]
    async fn archive_evaluation_survives_a_failed_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = Arc::new(InMemoryJobStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let notifier = Arc::new(InMemoryNotifier::new());
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryQueue::new("archive"),
            down: AtomicBool::new(true),
        });
        running_job(&jobs).await;

        let reporter = CompletionReporter::new(
            Arc::clone(&jobs),
            Arc::clone(&objects),
            Arc::clone(&notifier),
            Arc::clone(&queue),
            CompletionConfig {
                result_bucket: "results".to_string(),
                layout: ResultLayout::new("out", ".annot.vcf", ".count.log"),
            },
        );

        let err = reporter.report(outputs(dir.path())).await.unwrap_err();
        assert!(matches!(err, CompletionError::Queue(_)));
        assert!(queue.inner.is_empty());
        assert_eq!(notifier.sent().len(), 1);

        queue.down.store(false, Ordering::SeqCst);
        let replay = reporter.report(outputs(dir.path())).await.unwrap();
        assert_eq!(
            replay,
            Transition::Skipped {
                current: Some(JobStatus::Completed)
            }
        );
        assert_eq!(queue.inner.len(), 1);
        assert_eq!(notifier.sent().len(), 1);

        let result = ObjectRef::new("results", "out/U1/J1~J1.annot.vcf");
        assert_eq!(objects.class_of(&result), Some(StorageClass::Hot));
    }

    #[test]
    fn output_paths_follow_input() {
        let work = CompletedWork::from_input(
            "J1".parse().unwrap(),
            "U1".parse().unwrap(),
            "u1@example.com",
            Path::new("/work/J1/sample.v2.vcf"),
            ".annot.vcf",
            ".count.log",
        );
        assert_eq!(work.result_path, Path::new("/work/J1/sample.annot.vcf"));
        assert_eq!(work.log_path, Path::new("/work/J1/sample.v2.vcf.count.log"));
        assert_eq!(work.work_dir.as_deref(), Some(Path::new("/work/J1")));
    }

    #[test]
    fn guard_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("J1");
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("x"), "x").unwrap();

        drop(WorkDirGuard(Some(job_dir.clone())));
        assert!(!job_dir.exists());
    }
}
