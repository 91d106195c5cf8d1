//! Queue polling loop shared by every pipeline component.
//!
//! ## Design
//!
//! - One sequential loop per component: receive a batch, process each message
//!   to completion, repeat
//! - Handlers return a typed [`Outcome`]; the loop alone decides whether the
//!   message is deleted
//! - A failure is isolated to its message; nothing stops the loop except
//!   the shutdown signal
//! - Shutdown is checked between iterations and raced against the long poll,
//!   never against a handler in progress

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tierflow_events::{MessageQueue, QueueError, ReceivedMessage};

/// What to do with a message after handling it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Work done; delete the message.
    Complete,
    /// Leave the message; it is redelivered after the visibility window.
    Retry,
    /// The message can never succeed; delete it and log it as dropped.
    Discard,
}

/// Per-message processing logic of a pipeline component.
///
/// Must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ReceivedMessage) -> Outcome;
}

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, message: &ReceivedMessage) -> Outcome {
        (**self).handle(message).await
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Name for logging.
    pub name: String,
    /// Maximum messages per receive.
    pub batch_size: usize,
    /// Long-poll wait per receive.
    pub wait: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            name: "poller".to_string(),
            batch_size: 1,
            wait: Duration::from_secs(3),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl PollerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Poller runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PollerStats {
    pub received: u64,
    pub completed: u64,
    pub retried: u64,
    pub discarded: u64,
    pub receive_errors: u64,
    pub delete_errors: u64,
    pub uptime_secs: u64,
}

/// Handle to a spawned poller.
#[derive(Debug)]
pub struct PollerHandle {
    join: JoinHandle<()>,
    stats: Arc<Mutex<PollerStats>>,
}

impl PollerHandle {
    pub fn stats(&self) -> PollerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Wait for the loop to exit (after shutdown has been signalled) and
    /// return its final counters.
    pub async fn join(self) -> PollerStats {
        if let Err(e) = self.join.await {
            error!(error = %e, "poller task panicked");
        }
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Drives one [`MessageHandler`] from one queue.
pub struct Poller<Q, H> {
    queue: Q,
    handler: H,
    config: PollerConfig,
    stats: Arc<Mutex<PollerStats>>,
}

impl<Q, H> Poller<Q, H>
where
    Q: MessageQueue + 'static,
    H: MessageHandler + 'static,
{
    pub fn new(queue: Q, handler: H, config: PollerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
            stats: Arc::new(Mutex::new(PollerStats::default())),
        }
    }

    pub fn stats(&self) -> PollerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Receive one batch (waiting up to the configured wait) and process it.
    ///
    /// Returns the number of messages received.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let batch = self
            .queue
            .receive(self.config.batch_size, self.config.wait)
            .await?;
        let count = batch.len();
        self.process_batch(batch).await;
        Ok(count)
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poller = %self.config.name,
            queue = %self.queue.name(),
            batch_size = self.config.batch_size,
            wait_ms = self.config.wait.as_millis() as u64,
            "poller started"
        );
        let started = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                changed = shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => break,
                },
                r = self.queue.receive(self.config.batch_size, self.config.wait) => r,
            };

            match received {
                Ok(batch) => self.process_batch(batch).await,
                Err(e) => {
                    error!(poller = %self.config.name, error = %e, "receive failed");
                    self.record(|s| s.receive_errors += 1);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }

            let uptime = started.elapsed().as_secs();
            self.record(|s| s.uptime_secs = uptime);
        }

        info!(poller = %self.config.name, "poller stopped");
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> PollerHandle {
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(self.run(shutdown));
        PollerHandle { join, stats }
    }

    async fn process_batch(&self, batch: Vec<ReceivedMessage>) {
        for message in batch {
            self.record(|s| s.received += 1);
            let outcome = self.handler.handle(&message).await;
            debug!(
                poller = %self.config.name,
                receipt = %message.receipt,
                receive_count = message.receive_count,
                ?outcome,
                "message handled"
            );

            match outcome {
                Outcome::Retry => self.record(|s| s.retried += 1),
                Outcome::Complete | Outcome::Discard => {
                    if outcome == Outcome::Discard {
                        warn!(
                            poller = %self.config.name,
                            body = %message.body,
                            "dropping message"
                        );
                    }
                    match self.queue.delete(&message.receipt).await {
                        Ok(()) if outcome == Outcome::Complete => self.record(|s| s.completed += 1),
                        Ok(()) => self.record(|s| s.discarded += 1),
                        Err(e) => {
                            warn!(poller = %self.config.name, error = %e, "delete failed");
                            self.record(|s| s.delete_errors += 1);
                        }
                    }
                }
            }
        }
    }

    fn record(&self, f: impl FnOnce(&mut PollerStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierflow_events::InMemoryQueue;

    /// Routes on the body text.
    struct ScriptedHandler;

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, message: &ReceivedMessage) -> Outcome {
            match message.body.as_str() {
                "ok" => Outcome::Complete,
                "bad" => Outcome::Discard,
                _ => Outcome::Retry,
            }
        }
    }

    fn config() -> PollerConfig {
        PollerConfig::default()
            .with_name("test")
            .with_batch_size(10)
            .with_wait(Duration::ZERO)
    }

    #[tokio::test]
    async fn outcomes_decide_deletion() {
        let queue = Arc::new(InMemoryQueue::with_visibility("q", Duration::ZERO));
        for body in ["ok", "bad", "later"] {
            queue.send(body.to_string()).await.unwrap();
        }

        let poller = Poller::new(Arc::clone(&queue), ScriptedHandler, config());
        assert_eq!(poller.poll_once().await.unwrap(), 3);

        assert_eq!(queue.bodies(), vec!["later".to_string()]);
        let stats = poller.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.retried, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::new("q"));
        queue.send("ok".to_string()).await.unwrap();

        let poller = Poller::new(
            Arc::clone(&queue),
            ScriptedHandler,
            config().with_wait(Duration::from_secs(30)),
        );
        let (tx, rx) = watch::channel(false);
        let handle = poller.spawn(rx);

        // The long poll is pending by now; shutdown must interrupt it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();

        assert!(queue.is_empty());
    }
}
