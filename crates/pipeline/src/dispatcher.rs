//! Request dispatcher: `PENDING → RUNNING`.
//!
//! For each request: validate the input name, copy the input into a working
//! directory namespaced by job id, launch the compute worker and claim the
//! job. The message is deleted only once all of that has succeeded; a claim
//! whose launch failed is released so the redelivery can launch again.

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use tierflow_core::keys::has_extension;
use tierflow_core::{DomainError, JobStatus, RequestMessage, StatusUpdate, Transition};
use tierflow_events::{ReceivedMessage, decode_body};
use tierflow_infra::{JobStore, ObjectStore, ObjectStoreError};

use crate::launcher::{ComputeLauncher, LaunchRequest};
use crate::poller::{MessageHandler, Outcome};

/// Order of the launch and the `PENDING → RUNNING` claim.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// Claim first; launch only if the claim applied. A redelivered request
    /// for a job that is already running is acknowledged without a launch.
    #[default]
    ClaimThenLaunch,
    /// Launch first, then claim. A skipped claim means the job was launched
    /// twice; it is logged and acknowledged.
    LaunchThenClaim,
}

impl LaunchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchPolicy::ClaimThenLaunch => "claim-then-launch",
            LaunchPolicy::LaunchThenClaim => "launch-then-claim",
        }
    }
}

impl FromStr for LaunchPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "claim-then-launch" => Ok(LaunchPolicy::ClaimThenLaunch),
            "launch-then-claim" => Ok(LaunchPolicy::LaunchThenClaim),
            other => Err(DomainError::validation(format!(
                "unknown launch policy: {other}"
            ))),
        }
    }
}

impl core::fmt::Display for LaunchPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Root of the local working storage; each job gets `<work_dir>/<job_id>/`.
    pub work_dir: PathBuf,
    /// Required input extension, e.g. `.vcf`.
    pub input_extension: String,
    pub launch_policy: LaunchPolicy,
}

pub struct RequestDispatcher<S, O, L> {
    jobs: S,
    objects: O,
    launcher: L,
    config: DispatcherConfig,
}

impl<S, O, L> RequestDispatcher<S, O, L>
where
    S: JobStore,
    O: ObjectStore,
    L: ComputeLauncher,
{
    pub fn new(jobs: S, objects: O, launcher: L, config: DispatcherConfig) -> Self {
        Self {
            jobs,
            objects,
            launcher,
            config,
        }
    }

    async fn dispatch(&self, request: RequestMessage) -> Outcome {
        let job_id = &request.job_id;

        if !has_extension(&request.file_name, &self.config.input_extension) {
            warn!(
                job_id = %job_id,
                file_name = %request.file_name,
                expected = %self.config.input_extension,
                "rejecting input with unexpected extension"
            );
            return match self.objects.delete(&request.input()).await {
                Ok(()) => Outcome::Discard,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to delete rejected input");
                    Outcome::Retry
                }
            };
        }

        // Skip the copy for a job that is already past PENDING: its worker may
        // be reading the working directory.
        if self.config.launch_policy == LaunchPolicy::ClaimThenLaunch {
            match self.jobs.get(job_id).await {
                Ok(Some(record)) if record.status != JobStatus::Pending => {
                    info!(job_id = %job_id, status = %record.status, "job already claimed; not launching");
                    return Outcome::Complete;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(job_id = %job_id, "request for unknown job");
                    return Outcome::Discard;
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to load job");
                    return Outcome::Retry;
                }
            }
        }

        let job_dir = self.config.work_dir.join(job_id.as_str());
        let input_path = job_dir.join(&request.file_name);
        if let Err(e) = tokio::fs::create_dir_all(&job_dir).await {
            error!(job_id = %job_id, error = %e, "failed to create working directory");
            return Outcome::Retry;
        }
        match self.objects.get_to_file(&request.input(), &input_path).await {
            Ok(()) => debug!(job_id = %job_id, path = %input_path.display(), "input copied"),
            Err(ObjectStoreError::NotFound(object)) => {
                warn!(job_id = %job_id, %object, "input object is gone");
                remove_dir(&job_dir).await;
                return Outcome::Discard;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to copy input");
                return Outcome::Retry;
            }
        }

        let launch = LaunchRequest {
            job_id: request.job_id.clone(),
            user_id: request.user_id.clone(),
            user_email: request.user_email.clone(),
            input_path,
        };

        match self.config.launch_policy {
            LaunchPolicy::ClaimThenLaunch => match self.claim(&request).await {
                Some(Transition::Applied) => match self.launch(&launch).await {
                    Outcome::Retry => {
                        self.release(&request).await;
                        Outcome::Retry
                    }
                    outcome => outcome,
                },
                Some(Transition::Skipped { current }) => {
                    info!(job_id = %job_id, ?current, "job claimed concurrently; not launching");
                    Outcome::Complete
                }
                None => Outcome::Retry,
            },
            LaunchPolicy::LaunchThenClaim => {
                if let Outcome::Retry = self.launch(&launch).await {
                    return Outcome::Retry;
                }
                match self.claim(&request).await {
                    Some(Transition::Applied) => Outcome::Complete,
                    Some(Transition::Skipped { current }) => {
                        warn!(job_id = %job_id, ?current, "duplicate launch: job was already claimed");
                        Outcome::Complete
                    }
                    None => Outcome::Retry,
                }
            }
        }
    }

    async fn claim(&self, request: &RequestMessage) -> Option<Transition> {
        match self.jobs.transition(&request.job_id, &StatusUpdate::Start).await {
            Ok(t) => {
                if t.is_applied() {
                    info!(job_id = %request.job_id, "job running");
                }
                Some(t)
            }
            Err(e) => {
                error!(job_id = %request.job_id, error = %e, "failed to claim job");
                None
            }
        }
    }

    /// Hand a claim back to `PENDING` so the redelivered request launches.
    async fn release(&self, request: &RequestMessage) {
        match self.jobs.transition(&request.job_id, &StatusUpdate::Release).await {
            Ok(Transition::Applied) => {
                info!(job_id = %request.job_id, "claim released after failed launch")
            }
            Ok(Transition::Skipped { current }) => {
                warn!(job_id = %request.job_id, ?current, "claim changed before release")
            }
            Err(e) => {
                error!(job_id = %request.job_id, error = %e, "failed to release claim; job stays running")
            }
        }
    }

    async fn launch(&self, launch: &LaunchRequest) -> Outcome {
        match self.launcher.launch(launch).await {
            Ok(()) => Outcome::Complete,
            Err(e) => {
                error!(job_id = %launch.job_id, error = %e, "failed to launch compute worker");
                Outcome::Retry
            }
        }
    }
}

async fn remove_dir(dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        debug!(path = %dir.display(), error = %e, "failed to remove working directory");
    }
}

#[async_trait]
impl<S, O, L> MessageHandler for RequestDispatcher<S, O, L>
where
    S: JobStore,
    O: ObjectStore,
    L: ComputeLauncher,
{
    async fn handle(&self, message: &ReceivedMessage) -> Outcome {
        match decode_body::<RequestMessage>(&message.body) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                // Left in place for inspection until it expires.
                warn!(receipt = %message.receipt, error = %e, "malformed request message");
                Outcome::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tierflow_core::{JobRecord, ObjectRef, StorageClass};
    use tierflow_events::{InMemoryQueue, MessageQueue};
    use tierflow_infra::{InMemoryJobStore, InMemoryObjectStore};

    use crate::launcher::RecordingLauncher;

    struct Fixture {
        _dir: tempfile::TempDir,
        jobs: Arc<InMemoryJobStore>,
        objects: Arc<InMemoryObjectStore>,
        launcher: Arc<RecordingLauncher>,
        dispatcher: RequestDispatcher<Arc<InMemoryJobStore>, Arc<InMemoryObjectStore>, Arc<RecordingLauncher>>,
        work_dir: PathBuf,
    }

    fn fixture(policy: LaunchPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        let jobs = Arc::new(InMemoryJobStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let launcher = Arc::new(RecordingLauncher::new());
        let dispatcher = RequestDispatcher::new(
            Arc::clone(&jobs),
            Arc::clone(&objects),
            Arc::clone(&launcher),
            DispatcherConfig {
                work_dir: work_dir.clone(),
                input_extension: ".vcf".to_string(),
                launch_policy: policy,
            },
        );
        Fixture {
            _dir: dir,
            jobs,
            objects,
            launcher,
            dispatcher,
            work_dir,
        }
    }

    async fn seed(f: &Fixture, file_name: &str) -> RequestMessage {
        let input = ObjectRef::new("inputs", format!("in/U1/J1~{file_name}"));
        f.objects.insert(input.clone(), "#vcf", StorageClass::Hot);
        let record = JobRecord::pending(
            "J1".parse().unwrap(),
            "U1".parse().unwrap(),
            "u1@example.com",
            file_name,
            input,
            1,
        );
        f.jobs.create(&record).await.unwrap();
        RequestMessage::from_record(&record)
    }

    async fn deliver(f: &Fixture, request: &RequestMessage) -> Outcome {
        let queue = InMemoryQueue::with_visibility("requests", Duration::ZERO);
        tierflow_events::send_json(&queue, request).await.unwrap();
        let batch = queue.receive(1, Duration::ZERO).await.unwrap();
        f.dispatcher.handle(&batch[0]).await
    }

    async fn status(f: &Fixture) -> JobStatus {
        f.jobs.get(&"J1".parse().unwrap()).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn claims_copies_and_launches() {
        let f = fixture(LaunchPolicy::ClaimThenLaunch);
        let request = seed(&f, "J1.vcf").await;

        assert_eq!(deliver(&f, &request).await, Outcome::Complete);
        assert_eq!(status(&f).await, JobStatus::Running);

        let launches = f.launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].input_path, f.work_dir.join("J1").join("J1.vcf"));
        assert_eq!(
            tokio::fs::read_to_string(&launches[0].input_path).await.unwrap(),
            "#vcf"
        );
    }

    #[tokio::test]
    async fn replayed_request_does_not_relaunch() {
        let f = fixture(LaunchPolicy::ClaimThenLaunch);
        let request = seed(&f, "J1.vcf").await;

        assert_eq!(deliver(&f, &request).await, Outcome::Complete);
        assert_eq!(deliver(&f, &request).await, Outcome::Complete);
        assert_eq!(f.launcher.launches().len(), 1);
        assert_eq!(status(&f).await, JobStatus::Running);
    }

    #[tokio::test]
    async fn launch_then_claim_relaunches_on_replay() {
        let f = fixture(LaunchPolicy::LaunchThenClaim);
        let request = seed(&f, "J1.vcf").await;

        assert_eq!(deliver(&f, &request).await, Outcome::Complete);
        assert_eq!(deliver(&f, &request).await, Outcome::Complete);
        // Still a single successful claim.
        assert_eq!(f.launcher.launches().len(), 2);
        assert_eq!(status(&f).await, JobStatus::Running);
    }

    #[tokio::test]
    async fn wrong_extension_deletes_input_and_drops() {
        let f = fixture(LaunchPolicy::ClaimThenLaunch);
        let request = seed(&f, "J1.txt").await;

        assert_eq!(deliver(&f, &request).await, Outcome::Discard);
        assert!(!f.objects.contains(&request.input()));
        assert!(f.launcher.launches().is_empty());
        assert_eq!(status(&f).await, JobStatus::Pending);
    }

    #[tokio::test]
    async fn launch_failure_is_retried_under_launch_then_claim() {
        let f = fixture(LaunchPolicy::LaunchThenClaim);
        let request = seed(&f, "J1.vcf").await;
        f.launcher.set_failing(true);

        assert_eq!(deliver(&f, &request).await, Outcome::Retry);
        assert_eq!(status(&f).await, JobStatus::Pending);

        f.launcher.set_failing(false);
        assert_eq!(deliver(&f, &request).await, Outcome::Complete);
        assert_eq!(status(&f).await, JobStatus::Running);
    }

    #[tokio::test]
    async fn launch_failure_is_retried_under_claim_then_launch() {
        let f = fixture(LaunchPolicy::ClaimThenLaunch);
        let request = seed(&f, "J1.vcf").await;
        f.launcher.set_failing(true);

        assert_eq!(deliver(&f, &request).await, Outcome::Retry);
        assert_eq!(status(&f).await, JobStatus::Pending);
        assert!(f.launcher.launches().is_empty());

        f.launcher.set_failing(false);
        assert_eq!(deliver(&f, &request).await, Outcome::Complete);
        assert_eq!(status(&f).await, JobStatus::Running);
        assert_eq!(f.launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn malformed_message_is_left() {
        let f = fixture(LaunchPolicy::ClaimThenLaunch);
        let queue = InMemoryQueue::with_visibility("requests", Duration::ZERO);
        queue.send(r#"{"job_id":"J1"}"#.to_string()).await.unwrap();
        let batch = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(f.dispatcher.handle(&batch[0]).await, Outcome::Retry);
    }

    #[test]
    fn launch_policy_parses() {
        assert_eq!(
            "launch_then_claim".parse::<LaunchPolicy>().unwrap(),
            LaunchPolicy::LaunchThenClaim
        );
        assert_eq!(LaunchPolicy::default(), LaunchPolicy::ClaimThenLaunch);
        assert!("whenever".parse::<LaunchPolicy>().is_err());
    }
}
