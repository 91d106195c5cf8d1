//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream key**: `<prefix>:<queue name>`, one stream per queue
//! - **Consumer group**: shared by every worker draining the queue, so each
//!   entry is leased to one consumer at a time
//! - **Receipt**: the stream entry id
//! - **Visibility**: entries left unacknowledged longer than the visibility
//!   window are taken over with `XAUTOCLAIM` and redelivered
//! - **Delete**: `XACK` + `XDEL` in one atomic pipeline
//!
//! Receipts are entry ids, so a stale receipt still deletes the entry after it
//! has been reclaimed by another consumer. Handlers are idempotent, which
//! makes that harmless.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::Value;
use tracing::{debug, instrument, warn};

use tierflow_events::{MessageQueue, QueueError, ReceiptHandle, ReceivedMessage};

const DEFAULT_KEY_PREFIX: &str = "tierflow";
const DEFAULT_GROUP: &str = "tierflow";
const BODY_FIELD: &str = "body";

#[derive(Debug, Clone)]
pub struct RedisStreamsQueueConfig {
    pub key_prefix: String,
    pub group: String,
    /// Unique per process; defaults to `consumer-<pid>`.
    pub consumer: String,
    pub visibility_timeout: Duration,
}

impl Default for RedisStreamsQueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", std::process::id()),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: redis::Client,
    name: String,
    stream_key: String,
    config: RedisStreamsQueueConfig,
}

impl RedisStreamsQueue {
    /// Connect and make sure the stream and its consumer group exist.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        name: impl Into<String>,
        config: RedisStreamsQueueConfig,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let name = name.into();
        let queue = Self {
            client,
            stream_key: format!("{}:{}", config.key_prefix, name),
            name,
            config,
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Idempotent: an existing group is left untouched.
    async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Take over entries whose lease has lapsed.
    async fn claim_expired(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        count: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let min_idle_ms = self.config.visibility_timeout.as_millis().to_string();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XAUTOCLAIM failed: {e}")))?;

        // Reply: [next_cursor, [entries...], [deleted ids...]]
        let entries = match reply {
            Value::Bulk(parts) => parts.into_iter().nth(1).unwrap_or(Value::Nil),
            _ => Value::Nil,
        };

        let mut messages = Vec::new();
        for (id, fields) in parse_entries(&entries) {
            let receive_count = self.delivery_count(conn, &id).await.unwrap_or(2);
            match into_message(id, fields, receive_count) {
                Some(m) => messages.push(m),
                None => warn!(queue = %self.name, "reclaimed entry without a body"),
            }
        }
        Ok(messages)
    }

    async fn delivery_count(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &str,
    ) -> Result<u32, QueueError> {
        let reply: Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;

        // Reply: [[id, consumer, idle_ms, deliveries]]
        let count = match reply {
            Value::Bulk(rows) => match rows.first() {
                Some(Value::Bulk(row)) => match row.get(3) {
                    Some(Value::Int(n)) => u32::try_from(*n).ok(),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        };
        count.ok_or_else(|| QueueError::Command("unexpected XPENDING reply".to_string()))
    }

    async fn read_new(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        count: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(count);
        // BLOCK 0 would block forever.
        let block_ms = wait.as_millis();
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms.to_string());
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(">");

        let reply: Value = cmd
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        // Reply: nil on timeout, else [[stream_key, [entries...]]]
        let entries = match reply {
            Value::Bulk(streams) => streams
                .into_iter()
                .find_map(|s| match s {
                    Value::Bulk(mut pair) if pair.len() == 2 => pair.pop(),
                    _ => None,
                })
                .unwrap_or(Value::Nil),
            _ => Value::Nil,
        };

        Ok(parse_entries(&entries)
            .into_iter()
            .filter_map(|(id, fields)| into_message(id, fields, 1))
            .collect())
    }
}

#[async_trait]
impl MessageQueue for RedisStreamsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, body), fields(queue = %self.name), err)]
    async fn send(&self, body: String) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.name), err)]
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let count = max_messages.max(1);
        let mut conn = self.connection().await?;

        let reclaimed = self.claim_expired(&mut conn, count).await?;
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "redelivering expired leases");
            return Ok(reclaimed);
        }

        self.read_new(&mut conn, count, wait).await
    }

    #[instrument(skip(self), fields(queue = %self.name, receipt = %receipt), err)]
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let (acked, _deleted): (u64, u64) = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg(receipt.as_str())
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(receipt.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XACK/XDEL failed: {e}")))?;

        if acked == 0 {
            return Err(QueueError::InvalidReceipt(receipt.to_string()));
        }
        Ok(())
    }
}

fn into_message(
    id: String,
    mut fields: HashMap<String, String>,
    receive_count: u32,
) -> Option<ReceivedMessage> {
    let body = fields.remove(BODY_FIELD)?;
    Some(ReceivedMessage {
        receipt: ReceiptHandle::new(id),
        body,
        receive_count,
    })
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse a list of stream entries.
///
/// Entry format: `[id, [field1, value1, field2, value2, ...]]`. Entries that
/// were deleted while pending come back as nil and are skipped.
fn parse_entries(value: &Value) -> Vec<(String, HashMap<String, String>)> {
    let Value::Bulk(entries) = value else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let Value::Bulk(parts) = entry else {
                return None;
            };
            let id = value_to_string(parts.first()?)?;
            let Value::Bulk(raw_fields) = parts.get(1)? else {
                return None;
            };

            let fields = raw_fields
                .chunks(2)
                .filter_map(|chunk| match chunk {
                    [k, v] => Some((value_to_string(k)?, value_to_string(v)?)),
                    _ => None,
                })
                .collect();
            Some((id, fields))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_entries_and_skips_nil() {
        let reply = Value::Bulk(vec![
            Value::Bulk(vec![
                data("1-0"),
                Value::Bulk(vec![data("body"), data(r#"{"job_id":"J1"}"#)]),
            ]),
            Value::Nil,
            Value::Bulk(vec![data("2-0"), Value::Bulk(vec![data("other"), data("x")])]),
        ]);

        let entries = parse_entries(&reply);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "1-0");

        let messages: Vec<_> = entries
            .into_iter()
            .filter_map(|(id, f)| into_message(id, f, 1))
            .collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].receipt.as_str(), "1-0");
        assert_eq!(messages[0].body, r#"{"job_id":"J1"}"#);
    }

    #[test]
    fn nil_reply_is_empty() {
        assert!(parse_entries(&Value::Nil).is_empty());
    }
}
