//! Backend wiring and subcommand execution.

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info};

use tierflow_core::keys::input_key;
use tierflow_core::{JobId, ObjectRef, ServiceTier};
use tierflow_infra::{
    LocalObjectStore, ObjectStore, PostgresJobStore, PostgresProfiles, ProfileDirectory,
    RedisPubSubNotifier, RedisStreamsQueue,
};
use tierflow_pipeline::{
    ArchiveCoordinator, CompletedWork, CompletionReporter, MessageHandler, Poller, PollerHandle,
    ProcessLauncher, RequestDispatcher, RestoreCoordinator, Submission, ThawPoller, job_log,
    job_view, list_jobs, run_to_completion, submit, upgrade,
};

use crate::cli::Command;
use crate::settings::{PollSettings, Settings};

const COMPLETE_SUBCOMMAND: &str = "complete";

/// Connected backends shared by every subcommand.
struct Backends {
    jobs: Arc<PostgresJobStore>,
    profiles: Arc<PostgresProfiles>,
    objects: Arc<LocalObjectStore>,
}

impl Backends {
    async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(settings.database_url()?)
            .await
            .context("failed to connect to postgres")?;

        let objects = LocalObjectStore::new(&settings.object_root)
            .with_timings(settings.restore_timings());

        Ok(Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            profiles: Arc::new(PostgresProfiles::new(pool)),
            objects: Arc::new(objects),
        })
    }
}

async fn queue(settings: &Settings, name: &str) -> anyhow::Result<Arc<RedisStreamsQueue>> {
    let queue = RedisStreamsQueue::connect(&settings.redis_url, name, settings.queue_config())
        .await
        .with_context(|| format!("failed to open queue {name}"))?;
    Ok(Arc::new(queue))
}

/// Flips to `true` on ctrl-c.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c; shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}

fn spawn_poller<H>(
    queue: Arc<RedisStreamsQueue>,
    handler: H,
    settings: &PollSettings,
    name: &str,
    shutdown: &watch::Receiver<bool>,
) -> PollerHandle
where
    H: MessageHandler + 'static,
{
    Poller::new(queue, handler, settings.poller_config(name)).spawn(shutdown.clone())
}

async fn dispatcher(
    settings: &Settings,
    backends: &Backends,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<PollerHandle> {
    let requests = queue(settings, &settings.queues.requests).await?;
    let wrapper = std::env::current_exe().context("cannot locate the tierflow executable")?;
    let launcher = ProcessLauncher::new(wrapper).with_args([COMPLETE_SUBCOMMAND]);
    let handler = RequestDispatcher::new(
        backends.jobs.clone(),
        backends.objects.clone(),
        launcher,
        settings.dispatcher_config(),
    );
    Ok(spawn_poller(requests, handler, &settings.dispatcher, "dispatcher", shutdown))
}

async fn archive(
    settings: &Settings,
    backends: &Backends,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<PollerHandle> {
    let archive_eval = queue(settings, &settings.queues.archive_eval).await?;
    let handler = ArchiveCoordinator::new(backends.profiles.clone(), backends.objects.clone());
    Ok(spawn_poller(archive_eval, handler, &settings.archive, "archive", shutdown))
}

async fn restore(
    settings: &Settings,
    backends: &Backends,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<PollerHandle> {
    let restore_requests = queue(settings, &settings.queues.restore_requests).await?;
    let pending = queue(settings, &settings.queues.pending_restores).await?;
    let handler = RestoreCoordinator::new(backends.objects.clone(), pending)
        .with_days(settings.restore_days);
    Ok(spawn_poller(restore_requests, handler, &settings.restore, "restore", shutdown))
}

async fn thaw(
    settings: &Settings,
    backends: &Backends,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<PollerHandle> {
    let pending = queue(settings, &settings.queues.pending_restores).await?;
    let handler = ThawPoller::new(backends.objects.clone());
    Ok(spawn_poller(pending, handler, &settings.thaw, "thaw", shutdown))
}

async fn join_all(handles: Vec<PollerHandle>) {
    for handle in handles {
        let stats = handle.join().await;
        info!(?stats, "poller finished");
    }
}

pub async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
    let backends = Backends::connect(&settings).await?;

    match command {
        Command::Migrate => {
            backends.jobs.migrate().await?;
            backends.profiles.migrate().await?;
            info!("schema ready");
        }

        Command::Dispatcher => {
            let shutdown = shutdown_signal();
            join_all(vec![dispatcher(&settings, &backends, &shutdown).await?]).await;
        }
        Command::Archive => {
            let shutdown = shutdown_signal();
            join_all(vec![archive(&settings, &backends, &shutdown).await?]).await;
        }
        Command::Restore => {
            let shutdown = shutdown_signal();
            join_all(vec![restore(&settings, &backends, &shutdown).await?]).await;
        }
        Command::Thaw => {
            let shutdown = shutdown_signal();
            join_all(vec![thaw(&settings, &backends, &shutdown).await?]).await;
        }
        Command::All => {
            let shutdown = shutdown_signal();
            let handles = vec![
                dispatcher(&settings, &backends, &shutdown).await?,
                archive(&settings, &backends, &shutdown).await?,
                restore(&settings, &backends, &shutdown).await?,
                thaw(&settings, &backends, &shutdown).await?,
            ];
            join_all(handles).await;
        }

        Command::Complete {
            input_path,
            user_id,
            user_email,
            job_id,
        } => {
            let args: Vec<OsString> = settings.compute_args.iter().map(OsString::from).collect();
            let status = run_to_completion(&settings.compute_program, &args, &input_path).await?;
            if !status.success() {
                error!(job_id = %job_id, %status, "compute failed; job stays running");
                bail!("compute program exited with {status}");
            }

            let archive_eval = queue(&settings, &settings.queues.archive_eval).await?;
            let notifier = RedisPubSubNotifier::new(&settings.redis_url, &settings.notify_channel)?;
            let reporter = CompletionReporter::new(
                backends.jobs.clone(),
                backends.objects.clone(),
                notifier,
                archive_eval,
                settings.completion_config(),
            );
            let work = CompletedWork::from_input(
                job_id,
                user_id,
                user_email,
                &input_path,
                &settings.result_suffix,
                &settings.log_suffix,
            );
            let transition = reporter.report(work).await?;
            info!(?transition, "completion reported");
        }

        Command::Submit {
            user_id,
            email,
            file,
            job_id,
        } => {
            let job_id = job_id.unwrap_or_else(JobId::generate);
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .context("input path has no file name")?;
            let input = ObjectRef::new(
                settings.input_bucket.clone(),
                input_key(&settings.input_prefix, &user_id, &job_id, &file_name),
            );
            backends.objects.put_file(&input, &file).await?;

            let requests = queue(&settings, &settings.queues.requests).await?;
            let record = submit(
                &*backends.jobs,
                &*requests,
                Submission {
                    user_id,
                    user_email: email,
                    input,
                },
                Utc::now(),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Command::SetTier { user_id, tier } => {
            backends.profiles.set_tier(&user_id, tier).await?;
            info!(user_id = %user_id, role = tier.as_role(), "tier updated");
        }

        Command::Upgrade { user_id } => {
            let restore_requests = queue(&settings, &settings.queues.restore_requests).await?;
            let summary = upgrade(
                &*backends.profiles,
                &*backends.jobs,
                &*backends.objects,
                &*restore_requests,
                &user_id,
            )
            .await?;
            println!("{user_id} is now {}", ServiceTier::Premium.as_role());
            for job_id in &summary.restores_requested {
                println!("restore queued for {job_id}");
            }
        }

        Command::Status { user_id, job_id } => {
            let view = job_view(
                &*backends.jobs,
                &*backends.profiles,
                &*backends.objects,
                &user_id,
                &job_id,
                Utc::now(),
                settings.free_access_window,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }

        Command::Jobs { user_id } => {
            let records = list_jobs(&*backends.jobs, &user_id).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }

        Command::Log { user_id, job_id } => {
            tokio::fs::create_dir_all(&settings.work_dir)
                .await
                .with_context(|| format!("cannot create {}", settings.work_dir.display()))?;
            let text = job_log(
                &*backends.jobs,
                &*backends.objects,
                &user_id,
                &job_id,
                &settings.work_dir,
            )
            .await?;
            print!("{text}");
        }
    }

    Ok(())
}
