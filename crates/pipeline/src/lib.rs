//! `tierflow-pipeline`: the job lifecycle components.
//!
//! Each component is a [`MessageHandler`] driven by a [`Poller`]:
//!
//! - [`RequestDispatcher`]: `PENDING → RUNNING`, launches compute
//! - [`CompletionReporter`]: `RUNNING → COMPLETED`, notifies, requests archive evaluation
//! - [`ArchiveCoordinator`]: demotes free-tier results to archival storage
//! - [`RestoreCoordinator`]: starts restores, expedited first
//! - [`ThawPoller`]: promotes restored results back to hot storage
//!
//! Submission, tier upgrade and job lookup live in [`submission`].

pub mod archive;
pub mod completion;
pub mod dispatcher;
pub mod launcher;
pub mod poller;
pub mod restore;
pub mod submission;
pub mod thaw;

pub use archive::ArchiveCoordinator;
pub use completion::{CompletedWork, CompletionConfig, CompletionError, CompletionReporter};
pub use dispatcher::{DispatcherConfig, LaunchPolicy, RequestDispatcher};
pub use launcher::{
    ComputeLauncher, LaunchError, LaunchRequest, ProcessLauncher, RecordingLauncher,
    run_to_completion,
};
pub use poller::{MessageHandler, Outcome, Poller, PollerConfig, PollerHandle, PollerStats};
pub use restore::{DEFAULT_RESTORE_DAYS, RestoreCoordinator};
pub use submission::{
    JobView, Submission, SubmissionError, UpgradeSummary, default_free_access_window, job_log,
    job_view, list_jobs, submit, upgrade,
};
pub use thaw::ThawPoller;
