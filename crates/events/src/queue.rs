//! Durable work-queue abstraction (mechanics only).
//!
//! ## Delivery model
//!
//! - **At-least-once**: a message may be delivered more than once; handlers
//!   must be idempotent or guarded by conditional writes.
//! - **Leasing**: a received message is invisible to other consumers for the
//!   queue's visibility window. If it is not deleted before the window
//!   expires it becomes visible again and is redelivered.
//! - **No ordering**: messages for one job are correlated by `job_id` in the
//!   payload, never by arrival order.
//! - **Long polling**: `receive` suspends until a message is available or the
//!   wait elapses; consumers never busy-wait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::encode_body;

/// Opaque token identifying one delivery of a message.
///
/// Only the most recent delivery's handle is guaranteed to delete the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A leased message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub receipt: ReceiptHandle,
    pub body: String,
    /// How many times this message has been delivered, including this one.
    pub receive_count: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("message serialization error: {0}")]
    Serialization(String),

    #[error("unknown or expired receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("queue state poisoned")]
    Poisoned,
}

/// A durable, leasing message queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Queue name, for logging.
    fn name(&self) -> &str;

    /// Append a message body.
    async fn send(&self, body: String) -> Result<(), QueueError>;

    /// Lease up to `max_messages`, waiting at most `wait` for the first one.
    ///
    /// Returns an empty batch when the wait elapses without a message.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Permanently remove a leased message.
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send(&self, body: String) -> Result<(), QueueError> {
        (**self).send(body).await
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        (**self).receive(max_messages, wait).await
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        (**self).delete(receipt).await
    }
}

/// Serialize a typed message and send it.
pub async fn send_json<Q, M>(queue: &Q, message: &M) -> Result<(), QueueError>
where
    Q: MessageQueue + ?Sized,
    M: Serialize + ?Sized,
{
    let body = encode_body(message).map_err(|e| QueueError::Serialization(e.to_string()))?;
    queue.send(body).await
}
