//! Redis pub/sub notifier.
//!
//! Pub/sub is not durable: a notification published while no subscriber is
//! connected is lost. Notifications are advisory, so that is acceptable.

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::instrument;

use tierflow_core::NotificationMessage;
use tierflow_events::{Notifier, NotifyError};

#[derive(Debug, Clone)]
pub struct RedisPubSubNotifier {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubNotifier {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, NotifyError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| NotifyError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }
}

#[async_trait]
impl Notifier for RedisPubSubNotifier {
    #[instrument(skip(self, message), fields(channel = %self.channel), err)]
    async fn publish(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| NotifyError::Serialization(e.to_string()))?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| NotifyError::Connection(e.to_string()))?;

        let _: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| NotifyError::Publish(e.to_string()))?;

        Ok(())
    }
}
