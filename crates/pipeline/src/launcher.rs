//! Launching the external compute worker.
//!
//! The dispatcher never waits for the worker: [`ProcessLauncher`] spawns the
//! process and hands it to a supervision task that only logs how it exited.
//! The worker is responsible for reporting its own completion.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

use tierflow_core::{JobId, UserId};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn compute process: {0}")]
    Spawn(String),

    #[error("compute launch rejected: {0}")]
    Rejected(String),
}

/// Everything the compute worker needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub job_id: JobId,
    pub user_id: UserId,
    pub user_email: String,
    pub input_path: PathBuf,
}

impl LaunchRequest {
    /// Positional arguments passed to the worker: input path, user id, email, job id.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            self.input_path.clone().into_os_string(),
            self.user_id.as_str().into(),
            self.user_email.as_str().into(),
            self.job_id.as_str().into(),
        ]
    }
}

#[async_trait]
pub trait ComputeLauncher: Send + Sync {
    /// Start the worker detached. Returns once the process is running.
    async fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError>;
}

/// Spawns `<program> [base args...] <input> <user_id> <email> <job_id>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    base_args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl ComputeLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args(request.args())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| LaunchError::Spawn(format!("{}: {e}", self.program.display())))?;

        let job_id = request.job_id.clone();
        let pid = child.id();
        info!(job_id = %job_id, pid, "compute process launched");

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    info!(job_id = %job_id, pid, "compute process exited")
                }
                Ok(status) => {
                    warn!(job_id = %job_id, pid, %status, "compute process failed")
                }
                Err(e) => error!(job_id = %job_id, pid, error = %e, "lost compute process"),
            }
        });

        Ok(())
    }
}

/// Run a compute program in the foreground and wait for it.
///
/// Used by the completion wrapper, which owns the job's lifetime.
pub async fn run_to_completion(
    program: &Path,
    args: &[OsString],
    input_path: &Path,
) -> Result<ExitStatus, LaunchError> {
    Command::new(program)
        .args(args)
        .arg(input_path)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| LaunchError::Spawn(format!("{}: {e}", program.display())))
}

/// Records launches instead of spawning processes (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    launches: Mutex<Vec<LaunchRequest>>,
    fail: AtomicBool,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent launches fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ComputeLauncher for RecordingLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LaunchError::Rejected("launcher set to fail".to_string()));
        }
        let mut launches = self
            .launches
            .lock()
            .map_err(|_| LaunchError::Rejected("launcher state poisoned".to_string()))?;
        launches.push(request.clone());
        Ok(())
    }
}

#[async_trait]
impl<L> ComputeLauncher for std::sync::Arc<L>
where
    L: ComputeLauncher + ?Sized,
{
    async fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        (**self).launch(request).await
    }
}
