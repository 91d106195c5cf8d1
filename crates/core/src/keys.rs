//! Object key conventions.
//!
//! Input artifacts are uploaded as `<prefix>/<user_id>/<job_id>~<file_name>`.
//! Results are written under `<prefix>/<user_id>/` with the same
//! `<job_id>~` base: the result replaces the input extension with a fixed
//! suffix, the log appends its suffix to the full file name.

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, UserId};

/// Separator between the job id and the original file name in input keys.
pub const INPUT_KEY_SEPARATOR: char = '~';

/// Build the key an input artifact is uploaded under.
pub fn input_key(prefix: &str, user_id: &UserId, job_id: &JobId, file_name: &str) -> String {
    format!(
        "{}{user_id}/{job_id}{INPUT_KEY_SEPARATOR}{file_name}",
        dir_prefix(prefix)
    )
}

/// Split the base name of an input key into job id and original file name.
///
/// Only the first `~` separates; the file name itself may contain more.
pub fn parse_input_key(key: &str) -> DomainResult<(JobId, String)> {
    let base = key.rsplit('/').next().unwrap_or(key);
    let (job_id, file_name) = base.split_once(INPUT_KEY_SEPARATOR).ok_or_else(|| {
        DomainError::validation(format!("input key has no job id separator: {key}"))
    })?;
    if file_name.is_empty() {
        return Err(DomainError::validation(format!(
            "input key has no file name: {key}"
        )));
    }
    Ok((job_id.parse()?, file_name.to_string()))
}

/// Whether `name` carries the expected extension (case-insensitive).
pub fn has_extension(name: &str, extension: &str) -> bool {
    let ext = extension.trim_start_matches('.');
    match name.rsplit_once('.') {
        Some((stem, found)) => !stem.is_empty() && found.eq_ignore_ascii_case(ext),
        None => false,
    }
}

/// Result/log key layout for completed jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLayout {
    pub prefix: String,
    pub result_suffix: String,
    pub log_suffix: String,
}

impl ResultLayout {
    pub fn new(
        prefix: impl Into<String>,
        result_suffix: impl Into<String>,
        log_suffix: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            result_suffix: result_suffix.into(),
            log_suffix: log_suffix.into(),
        }
    }

    /// `<prefix>/<user_id>/<job_id>~<stem><result_suffix>`, where the stem is
    /// the file name up to its first `.`.
    pub fn result_key(&self, user_id: &UserId, job_id: &JobId, file_name: &str) -> String {
        format!(
            "{}{user_id}/{job_id}{INPUT_KEY_SEPARATOR}{}{}",
            dir_prefix(&self.prefix),
            file_stem(file_name),
            self.result_suffix
        )
    }

    /// `<prefix>/<user_id>/<job_id>~<file_name><log_suffix>`.
    pub fn log_key(&self, user_id: &UserId, job_id: &JobId, file_name: &str) -> String {
        format!(
            "{}{user_id}/{job_id}{INPUT_KEY_SEPARATOR}{file_name}{}",
            dir_prefix(&self.prefix),
            self.log_suffix
        )
    }
}

/// File name up to its first `.`; the whole name when it has none.
pub fn file_stem(file_name: &str) -> &str {
    file_name.split('.').next().unwrap_or(file_name)
}

fn dir_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}
