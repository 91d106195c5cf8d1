//! In-memory leasing queue for tests/dev.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::queue::{MessageQueue, QueueError, ReceiptHandle, ReceivedMessage};

#[derive(Debug)]
struct Entry {
    body: String,
    receive_count: u32,
    /// `Some` while leased; the message is invisible until this instant.
    invisible_until: Option<Instant>,
    /// Handle of the most recent delivery.
    receipt: Option<ReceiptHandle>,
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<Entry>,
    next_receipt: u64,
}

/// In-memory queue with visibility leases.
///
/// - Process-local, not durable
/// - Redelivers a leased message once its visibility window lapses
/// - A zero visibility window makes every receive see every message
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    state: Mutex<State>,
    arrived: Notify,
}

impl InMemoryQueue {
    pub const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30);

    pub fn new(name: impl Into<String>) -> Self {
        Self::with_visibility(name, Self::DEFAULT_VISIBILITY)
    }

    pub fn with_visibility(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            state: Mutex::new(State::default()),
            arrived: Notify::new(),
        }
    }

    /// Number of messages not yet deleted (leased or not).
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies of all messages not yet deleted, in arrival order.
    pub fn bodies(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.entries.iter().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Lease whatever is visible now; also report when the next lease lapses.
    fn take_visible(
        &self,
        max_messages: usize,
    ) -> Result<(Vec<ReceivedMessage>, Option<Instant>), QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        let now = Instant::now();
        let mut out = Vec::new();
        let mut next_expiry: Option<Instant> = None;

        let State {
            entries,
            next_receipt,
        } = &mut *state;

        for entry in entries.iter_mut() {
            let visible = entry.invisible_until.is_none_or(|until| until <= now);
            if !visible {
                next_expiry = Some(match (next_expiry, entry.invisible_until) {
                    (Some(a), Some(b)) => a.min(b),
                    (a, b) => a.or(b).unwrap_or(now),
                });
                continue;
            }
            if out.len() >= max_messages {
                break;
            }

            *next_receipt += 1;
            let receipt = ReceiptHandle::new(format!("{}-{}", self.name, next_receipt));
            entry.receive_count += 1;
            entry.invisible_until = Some(now + self.visibility_timeout);
            entry.receipt = Some(receipt.clone());

            out.push(ReceivedMessage {
                receipt,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }

        Ok((out, next_expiry))
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: String) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
            state.entries.push_back(Entry {
                body,
                receive_count: 0,
                invisible_until: None,
                receipt: None,
            });
        }
        self.arrived.notify_one();
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        let max_messages = max_messages.max(1);

        loop {
            // Register interest before checking so a concurrent send is not missed.
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let (batch, next_expiry) = self.take_visible(max_messages)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_expiry.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut arrived => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        let position = state
            .entries
            .iter()
            .position(|e| e.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::InvalidReceipt(receipt.to_string()))?;
        state.entries.remove(position);
        Ok(())
    }
}
