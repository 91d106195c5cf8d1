//! Queue and notification mechanics.
//!
//! Transport-agnostic contracts for the durable work queues that connect the
//! pipeline components, plus the fire-and-forget notification channel.
//! Infrastructure-backed implementations (Redis) live in `tierflow-infra`.

pub mod envelope;
pub mod in_memory_queue;
pub mod notify;
pub mod queue;

pub use envelope::{DecodeError, decode_body, encode_body};
pub use in_memory_queue::InMemoryQueue;
pub use notify::{InMemoryNotifier, Notifier, NotifyError};
pub use queue::{MessageQueue, QueueError, ReceiptHandle, ReceivedMessage, send_json};
