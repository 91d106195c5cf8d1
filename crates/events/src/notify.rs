//! Notification channel (fire-and-forget, at-least-once).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use tierflow_core::NotificationMessage;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification connection error: {0}")]
    Connection(String),

    #[error("notification publish error: {0}")]
    Publish(String),

    #[error("notification serialization error: {0}")]
    Serialization(String),

    #[error("notifier state poisoned")]
    Poisoned,
}

/// Publishes user-facing notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, message: &NotificationMessage) -> Result<(), NotifyError>;
}

#[async_trait]
impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    async fn publish(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        (**self).publish(message).await
    }
}

/// Records every published notification.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<NotificationMessage>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<NotificationMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn publish(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        let mut sent = self.sent.lock().map_err(|_| NotifyError::Poisoned)?;
        sent.push(message.clone());
        Ok(())
    }
}
