//! Durable at-least-once message channel.

/// SQLite-backed queue sharing the inventory database.
pub mod sqlite;

use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::{persist::PersistError, types::MessageId};

pub use sqlite::SqliteQueue;

/// Channel failure.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Storage failure.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The message does not exist or is no longer claimed.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    /// The transport refused the message.
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Result alias for queue calls.
pub type QueueResult<T> = Result<T, QueueError>;

/// A claimed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message id, used to ack or nack.
    pub message_id: MessageId,
    /// Topic the message was published on.
    pub topic: String,
    /// Opaque payload.
    pub body: Vec<u8>,
    /// Delivery count including this one.
    pub attempts: u32,
}

/// A message that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedMessage {
    /// Message id.
    pub message_id: MessageId,
    /// Opaque payload.
    pub body: Vec<u8>,
    /// Deliveries made.
    pub attempts: u32,
    /// Error of the last delivery.
    pub last_error: Option<String>,
}

/// What happens to a message after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// Redelivered after `delay`.
    RetryAfter {
        /// Delivery count so far.
        attempts: u32,
        /// Backoff before the next delivery.
        delay: Duration,
    },
    /// Moved out of the ready set.
    Parked {
        /// Delivery count so far.
        attempts: u32,
    },
}

/// Redelivery limits with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Deliveries before a message is parked.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `attempts`-th failed delivery: `base * 2^(attempts-1)`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// True while another delivery is allowed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Publish/consume channel with at-least-once delivery.
pub trait MessageQueue: Send + Sync {
    /// Durably enqueues `body` on `topic`.
    fn publish(&self, topic: &str, body: &[u8]) -> QueueResult<MessageId>;

    /// Enqueues `body` as part of the caller's open write transaction on `conn`.
    ///
    /// Queues living in that database insert through `conn`, so the message
    /// commits or rolls back with the caller's rows. Other transports publish
    /// right away and the caller rolls back when this fails.
    fn publish_in(&self, conn: &Connection, topic: &str, body: &[u8]) -> QueueResult<MessageId> {
        let _ = conn;
        self.publish(topic, body)
    }

    /// Claims the oldest ready message for `lease`; unacked claims come back after it.
    ///
    /// A message whose lease expired after its last allowed delivery is parked
    /// instead of being handed out again.
    fn claim(&self, topic: &str, lease: Duration, policy: &RetryPolicy) -> QueueResult<Option<Envelope>>;

    /// Removes a processed message.
    fn ack(&self, message_id: MessageId) -> QueueResult<()>;

    /// Records a failed delivery and schedules a retry or parks the message.
    fn nack(&self, message_id: MessageId, error: &str, policy: &RetryPolicy) -> QueueResult<Redelivery>;

    /// Messages on `topic` not yet acked or parked.
    fn backlog(&self, topic: &str) -> QueueResult<u64>;
}
