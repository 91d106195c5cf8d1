//! Process configuration.
//!
//! Every value comes from a `TIERFLOW_*` environment variable (an optional
//! `.env` file is loaded first by the binary) and falls back to a default.
//! The resulting [`Settings`] is built once and handed to each component as
//! its own config type.

use core::fmt::Display;
use core::str::FromStr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use tierflow_core::keys::ResultLayout;
use tierflow_infra::{RedisStreamsQueueConfig, RestoreTimings};
use tierflow_observability::{LogFormat, LogSettings};
use tierflow_pipeline::{
    CompletionConfig, DEFAULT_RESTORE_DAYS, DispatcherConfig, LaunchPolicy, PollerConfig,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Queue names, one per pipeline hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub requests: String,
    pub archive_eval: String,
    pub restore_requests: String,
    pub pending_restores: String,
}

/// Batch size and long-poll wait of one poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub batch_size: usize,
    pub wait: Duration,
}

impl PollSettings {
    pub fn poller_config(&self, name: &str) -> PollerConfig {
        PollerConfig::default()
            .with_name(name)
            .with_batch_size(self.batch_size)
            .with_wait(self.wait)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub redis_url: String,
    pub queue_prefix: String,
    pub queues: QueueNames,
    pub visibility_timeout: Duration,
    pub notify_channel: String,

    pub object_root: PathBuf,
    /// `None` disables the tier in the local object store.
    pub expedited_restore: Option<Duration>,
    pub standard_restore: Option<Duration>,

    pub input_bucket: String,
    pub input_prefix: String,
    pub input_extension: String,
    pub result_bucket: String,
    pub result_prefix: String,
    pub result_suffix: String,
    pub log_suffix: String,

    pub work_dir: PathBuf,
    pub launch_policy: LaunchPolicy,
    pub compute_program: PathBuf,
    pub compute_args: Vec<String>,

    pub dispatcher: PollSettings,
    pub archive: PollSettings,
    pub restore: PollSettings,
    pub thaw: PollSettings,
    pub restore_days: u32,
    pub free_access_window: chrono::Duration,

    pub log: LogSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let poll = |batch_key: &'static str,
                    wait_key: &'static str,
                    batch: usize,
                    wait: u64|
         -> Result<PollSettings, ConfigError> {
            let batch_size: usize = env.parse(batch_key, batch)?;
            if batch_size == 0 {
                return Err(ConfigError::Invalid {
                    key: batch_key,
                    value: "0".to_string(),
                    reason: "batch size must be positive".to_string(),
                });
            }
            Ok(PollSettings {
                batch_size,
                wait: Duration::from_secs(env.parse(wait_key, wait)?),
            })
        };

        let dispatcher = poll(
            "TIERFLOW_DISPATCHER_BATCH",
            "TIERFLOW_DISPATCHER_WAIT_SECS",
            1,
            3,
        )?;
        let archive = poll(
            "TIERFLOW_ARCHIVE_BATCH",
            "TIERFLOW_ARCHIVE_WAIT_SECS",
            1,
            3,
        )?;
        let restore = poll(
            "TIERFLOW_RESTORE_BATCH",
            "TIERFLOW_RESTORE_WAIT_SECS",
            1,
            3,
        )?;
        let thaw = poll(
            "TIERFLOW_THAW_BATCH",
            "TIERFLOW_THAW_WAIT_SECS",
            10,
            10,
        )?;

        let free_window_secs: i64 = env.parse("TIERFLOW_FREE_ACCESS_WINDOW_SECS", 300)?;

        Ok(Self {
            database_url: env.get("TIERFLOW_DATABASE_URL"),
            redis_url: env.string("TIERFLOW_REDIS_URL", "redis://127.0.0.1:6379"),
            queue_prefix: env.string("TIERFLOW_QUEUE_PREFIX", "tierflow"),
            queues: QueueNames {
                requests: env.string("TIERFLOW_REQUEST_QUEUE", "job-requests"),
                archive_eval: env.string("TIERFLOW_ARCHIVE_QUEUE", "archive-eval"),
                restore_requests: env.string("TIERFLOW_RESTORE_QUEUE", "restore-requests"),
                pending_restores: env.string("TIERFLOW_PENDING_RESTORE_QUEUE", "pending-restores"),
            },
            visibility_timeout: Duration::from_secs(
                env.parse("TIERFLOW_VISIBILITY_TIMEOUT_SECS", 30)?,
            ),
            notify_channel: env.string("TIERFLOW_NOTIFY_CHANNEL", "job-notifications"),

            object_root: env.string("TIERFLOW_OBJECT_ROOT", "./data/objects").into(),
            expedited_restore: env.optional_secs("TIERFLOW_EXPEDITED_RESTORE_SECS", 60)?,
            standard_restore: env.optional_secs("TIERFLOW_STANDARD_RESTORE_SECS", 300)?,

            input_bucket: env.string("TIERFLOW_INPUT_BUCKET", "inputs"),
            input_prefix: env.string("TIERFLOW_INPUT_PREFIX", "in"),
            input_extension: env.string("TIERFLOW_INPUT_EXTENSION", ".vcf"),
            result_bucket: env.string("TIERFLOW_RESULT_BUCKET", "results"),
            result_prefix: env.string("TIERFLOW_RESULT_PREFIX", "out"),
            result_suffix: env.string("TIERFLOW_RESULT_SUFFIX", ".annot.vcf"),
            log_suffix: env.string("TIERFLOW_LOG_SUFFIX", ".count.log"),

            work_dir: env.string("TIERFLOW_WORK_DIR", "./data/work").into(),
            launch_policy: env.parse("TIERFLOW_LAUNCH_POLICY", LaunchPolicy::default())?,
            compute_program: env.string("TIERFLOW_COMPUTE_PROGRAM", "annotate").into(),
            compute_args: env
                .get("TIERFLOW_COMPUTE_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),

            dispatcher,
            archive,
            restore,
            thaw,
            restore_days: env.parse("TIERFLOW_RESTORE_DAYS", DEFAULT_RESTORE_DAYS)?,
            free_access_window: chrono::Duration::seconds(free_window_secs),

            log: LogSettings {
                format: env.parse("TIERFLOW_LOG_FORMAT", LogFormat::default())?,
                default_filter: env.string("TIERFLOW_LOG_FILTER", "info"),
            },
        })
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("TIERFLOW_DATABASE_URL"))
    }

    pub fn queue_config(&self) -> RedisStreamsQueueConfig {
        RedisStreamsQueueConfig {
            key_prefix: self.queue_prefix.clone(),
            visibility_timeout: self.visibility_timeout,
            ..RedisStreamsQueueConfig::default()
        }
    }

    pub fn restore_timings(&self) -> RestoreTimings {
        let to_chrono = |d: Duration| chrono::Duration::from_std(d).ok();
        RestoreTimings {
            expedited: self.expedited_restore.and_then(to_chrono),
            standard: self.standard_restore.and_then(to_chrono),
            ..RestoreTimings::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            work_dir: self.work_dir.clone(),
            input_extension: self.input_extension.clone(),
            launch_policy: self.launch_policy,
        }
    }

    pub fn completion_config(&self) -> CompletionConfig {
        CompletionConfig {
            result_bucket: self.result_bucket.clone(),
            layout: ResultLayout::new(
                self.result_prefix.clone(),
                self.result_suffix.clone(),
                self.log_suffix.clone(),
            ),
        }
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Blank values count as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    /// Seconds, or `off` to disable.
    fn optional_secs(&self, key: &'static str, default: u64) -> Result<Option<Duration>, ConfigError> {
        match self.get(key) {
            Some(v) if v.eq_ignore_ascii_case("off") => Ok(None),
            _ => Ok(Some(Duration::from_secs(self.parse(key, default)?))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn defaults_cover_every_component() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.dispatcher.batch_size, 1);
        assert_eq!(s.dispatcher.wait, Duration::from_secs(3));
        assert_eq!(s.thaw.batch_size, 10);
        assert_eq!(s.thaw.wait, Duration::from_secs(10));
        assert_eq!(s.visibility_timeout, Duration::from_secs(30));
        assert_eq!(s.restore_days, 1);
        assert_eq!(s.input_extension, ".vcf");
        assert_eq!(s.launch_policy, LaunchPolicy::ClaimThenLaunch);
        assert_eq!(s.free_access_window, chrono::Duration::minutes(5));
        assert_eq!(s.log.format, LogFormat::Json);
        assert!(s.database_url.is_none());
        assert_eq!(
            s.database_url().unwrap_err(),
            ConfigError::Missing("TIERFLOW_DATABASE_URL")
        );
    }

    #[test]
    fn overrides_are_applied() {
        let s = settings(&[
            ("TIERFLOW_DATABASE_URL", "postgres://localhost/tierflow"),
            ("TIERFLOW_THAW_BATCH", "25"),
            ("TIERFLOW_LAUNCH_POLICY", "launch-then-claim"),
            ("TIERFLOW_LOG_FORMAT", "pretty"),
            ("TIERFLOW_COMPUTE_ARGS", "--threads 4"),
            ("TIERFLOW_EXPEDITED_RESTORE_SECS", "off"),
        ])
        .unwrap();
        assert_eq!(s.database_url().unwrap(), "postgres://localhost/tierflow");
        assert_eq!(s.thaw.batch_size, 25);
        assert_eq!(s.launch_policy, LaunchPolicy::LaunchThenClaim);
        assert_eq!(s.log.format, LogFormat::Pretty);
        assert_eq!(s.compute_args, vec!["--threads", "4"]);
        assert!(s.restore_timings().expedited.is_none());
        assert_eq!(s.restore_timings().standard, Some(chrono::Duration::minutes(5)));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let s = settings(&[("TIERFLOW_RESULT_SUFFIX", "  ")]).unwrap();
        assert_eq!(s.result_suffix, ".annot.vcf");
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = settings(&[("TIERFLOW_RESTORE_DAYS", "soon")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "TIERFLOW_RESTORE_DAYS", .. }
        ));

        let err = settings(&[("TIERFLOW_ARCHIVE_BATCH", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "TIERFLOW_ARCHIVE_BATCH", .. }
        ));
    }

    #[test]
    fn component_configs_follow_settings() {
        let s = settings(&[("TIERFLOW_RESULT_PREFIX", "results-out")]).unwrap();
        let completion = s.completion_config();
        assert_eq!(
            completion
                .layout
                .result_key(&"U1".parse().unwrap(), &"J1".parse().unwrap(), "J1.vcf"),
            "results-out/U1/J1~J1.annot.vcf"
        );
        assert_eq!(s.queue_config().key_prefix, "tierflow");
        assert_eq!(s.dispatcher.poller_config("dispatcher").batch_size, 1);
    }
}
