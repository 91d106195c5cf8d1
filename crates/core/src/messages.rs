//! Queue message schemas.
//!
//! Field names are the wire names shared with the compute wrapper and the web
//! front end; do not rename them.

use serde::{Deserialize, Serialize};

use crate::id::{JobId, UserId};
use crate::job::JobRecord;
use crate::storage::ObjectRef;

/// A newly submitted job, published by the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub job_id: JobId,
    pub user_id: UserId,
    pub user_email: String,
    pub file_name: String,
    pub input_bucket: String,
    pub input_key: String,
}

impl RequestMessage {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            user_id: record.user_id.clone(),
            user_email: record.user_email.clone(),
            file_name: record.file_name.clone(),
            input_bucket: record.input_bucket.clone(),
            input_key: record.input_key.clone(),
        }
    }

    pub fn input(&self) -> ObjectRef {
        ObjectRef::new(self.input_bucket.clone(), self.input_key.clone())
    }
}

/// Ask the archive coordinator to apply the tier policy to a finished result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEvalMessage {
    pub job_id: JobId,
    pub user_id: UserId,
    pub result_bucket: String,
    pub result_key: String,
}

impl ArchiveEvalMessage {
    pub fn new(job_id: JobId, user_id: UserId, result: &ObjectRef) -> Self {
        Self {
            job_id,
            user_id,
            result_bucket: result.bucket.clone(),
            result_key: result.key.clone(),
        }
    }

    pub fn result(&self) -> ObjectRef {
        ObjectRef::new(self.result_bucket.clone(), self.result_key.clone())
    }
}

/// Ask the restore coordinator to bring an archived result back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequestMessage {
    pub job_id: JobId,
    pub result_bucket: String,
    pub result_key: String,
}

impl RestoreRequestMessage {
    pub fn new(job_id: JobId, result: &ObjectRef) -> Self {
        Self {
            job_id,
            result_bucket: result.bucket.clone(),
            result_key: result.key.clone(),
        }
    }

    pub fn result(&self) -> ObjectRef {
        ObjectRef::new(self.result_bucket.clone(), self.result_key.clone())
    }

    /// The tracking message handed to the thaw poller once the restore is
    /// accepted.
    pub fn pending(&self) -> PendingRestoreMessage {
        PendingRestoreMessage {
            job_id: self.job_id.clone(),
            result_bucket: self.result_bucket.clone(),
            result_key: self.result_key.clone(),
        }
    }
}

/// A restore in flight, re-checked by the thaw poller until it completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRestoreMessage {
    pub job_id: JobId,
    pub result_bucket: String,
    pub result_key: String,
}

impl PendingRestoreMessage {
    pub fn result(&self) -> ObjectRef {
        ObjectRef::new(self.result_bucket.clone(), self.result_key.clone())
    }
}

/// Fire-and-forget user notification, fanned out to the email consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub email: String,
    pub message: String,
}

impl NotificationMessage {
    pub fn job_completed(email: impl Into<String>, job_id: &JobId) -> Self {
        Self {
            email: email.into(),
            message: format!("Dear user:\nYour job {job_id} is finished."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_message_decodes_wire_fields() {
        let body = json!({
            "job_id": "J1",
            "user_id": "U1",
            "user_email": "u1@example.com",
            "file_name": "J1.vcf",
            "input_bucket": "inputs",
            "input_key": "in/U1/J1~J1.vcf",
        });
        let msg: RequestMessage = serde_json::from_value(body).unwrap();
        assert_eq!(msg.job_id.as_str(), "J1");
        assert_eq!(msg.input(), ObjectRef::new("inputs", "in/U1/J1~J1.vcf"));
    }

    #[test]
    fn missing_field_is_rejected() {
        let body = json!({"job_id": "J1", "user_id": "U1"});
        assert!(serde_json::from_value::<RequestMessage>(body).is_err());
    }

    #[test]
    fn pending_restore_keeps_object_reference() {
        let result = ObjectRef::new("results", "out/U1/J1.result");
        let req = RestoreRequestMessage::new("J1".parse().unwrap(), &result);
        let pending = req.pending();
        assert_eq!(pending.result(), result);
        assert_eq!(
            serde_json::to_value(&pending).unwrap(),
            json!({"job_id": "J1", "result_bucket": "results", "result_key": "out/U1/J1.result"})
        );
    }
}
