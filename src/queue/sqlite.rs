//! Queue table sharing the inventory database.
//!
//! Claims are leases: a claimed row stays in the table with `available_at_ms`
//! pushed past the lease and comes back if it is neither acked nor nacked.

use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::{
    persist::{Database, PersistError, now_ms},
    types::MessageId,
};

use super::{Envelope, MessageQueue, ParkedMessage, QueueError, QueueResult, Redelivery, RetryPolicy};

const STATUS_READY: i64 = 0;
const STATUS_PARKED: i64 = 1;

/// Queue stored in the `queue_message` table.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    db: Database,
}

impl SqliteQueue {
    /// Wraps `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Parked messages on `topic`, oldest first.
    pub fn parked(&self, topic: &str) -> QueueResult<Vec<ParkedMessage>> {
        let conn = self.db.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT message_id, body, attempts, last_error FROM queue_message
                 WHERE topic = ?1 AND status = ?2 ORDER BY message_id ASC",
            )
            .map_err(PersistError::from)?;
        let rows = stmt
            .query_map(params![topic, STATUS_PARKED], |row| {
                let id: i64 = row.get(0)?;
                Ok(ParkedMessage {
                    message_id: id as MessageId,
                    body: row.get(1)?,
                    attempts: row.get(2)?,
                    last_error: row.get(3)?,
                })
            })
            .map_err(PersistError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(PersistError::from)?);
        }
        Ok(out)
    }

    /// Moves parked messages on `topic` back to ready with a fresh attempt count.
    pub fn requeue_parked(&self, topic: &str) -> QueueResult<usize> {
        let count = self.db.write(|tx| {
            tx.execute(
                "UPDATE queue_message SET status = ?1, attempts = 0, available_at_ms = ?2
                 WHERE topic = ?3 AND status = ?4",
                params![STATUS_READY, now_ms(), topic, STATUS_PARKED],
            )
            .map_err(PersistError::from)
        })?;
        debug!(topic, count, "parked messages requeued");
        Ok(count)
    }
}

fn insert_message(conn: &Connection, topic: &str, body: &[u8]) -> Result<MessageId, PersistError> {
    let now = now_ms();
    conn.execute(
        "INSERT INTO queue_message(topic, body, status, attempts, available_at_ms, created_at_ms)
         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        params![topic, body, STATUS_READY, now],
    )?;
    Ok(conn.last_insert_rowid() as MessageId)
}

impl MessageQueue for SqliteQueue {
    fn publish(&self, topic: &str, body: &[u8]) -> QueueResult<MessageId> {
        Ok(self.db.write(|tx| insert_message(tx, topic, body))?)
    }

    /// `conn` must belong to this queue's database.
    fn publish_in(&self, conn: &Connection, topic: &str, body: &[u8]) -> QueueResult<MessageId> {
        Ok(insert_message(conn, topic, body)?)
    }

    fn claim(&self, topic: &str, lease: Duration, policy: &RetryPolicy) -> QueueResult<Option<Envelope>> {
        let now = now_ms();
        let lease_until = now.saturating_add(lease.as_millis() as i64);
        let claimed = self.db.write(|tx| {
            // Deliveries that crashed or timed out never reach nack.
            let expired = tx
                .execute(
                    "UPDATE queue_message SET status = ?1, last_error = 'lease expired after final delivery'
                     WHERE topic = ?2 AND status = ?3 AND available_at_ms <= ?4 AND attempts >= ?5",
                    params![STATUS_PARKED, topic, STATUS_READY, now, policy.max_attempts],
                )
                .map_err(PersistError::from)?;
            if expired > 0 {
                warn!(topic, count = expired, "messages parked after expired leases");
            }

            tx.query_row(
                "UPDATE queue_message SET attempts = attempts + 1, available_at_ms = ?1
                 WHERE message_id = (
                     SELECT message_id FROM queue_message
                     WHERE topic = ?2 AND status = ?3 AND available_at_ms <= ?4
                     ORDER BY available_at_ms ASC, message_id ASC LIMIT 1)
                 RETURNING message_id, topic, body, attempts",
                params![lease_until, topic, STATUS_READY, now],
                |row| {
                    let id: i64 = row.get(0)?;
                    Ok(Envelope {
                        message_id: id as MessageId,
                        topic: row.get(1)?,
                        body: row.get(2)?,
                        attempts: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(PersistError::from)
        })?;
        Ok(claimed)
    }

    fn ack(&self, message_id: MessageId) -> QueueResult<()> {
        let removed = self.db.write(|tx| {
            tx.execute(
                "DELETE FROM queue_message WHERE message_id = ?1",
                params![message_id as i64],
            )
            .map_err(PersistError::from)
        })?;
        if removed == 0 {
            return Err(QueueError::UnknownMessage(message_id));
        }
        Ok(())
    }

    fn nack(&self, message_id: MessageId, error: &str, policy: &RetryPolicy) -> QueueResult<Redelivery> {
        self.db.write(|tx| {
            let attempts: Option<u32> = tx
                .query_row(
                    "SELECT attempts FROM queue_message WHERE message_id = ?1 AND status = ?2",
                    params![message_id as i64, STATUS_READY],
                    |row| row.get(0),
                )
                .optional()
                .map_err(PersistError::from)?;
            let Some(attempts) = attempts else {
                return Err(QueueError::UnknownMessage(message_id));
            };

            if policy.should_retry(attempts) {
                let delay = policy.delay_for_attempt(attempts);
                tx.execute(
                    "UPDATE queue_message SET available_at_ms = ?1, last_error = ?2 WHERE message_id = ?3",
                    params![
                        now_ms().saturating_add(delay.as_millis() as i64),
                        error,
                        message_id as i64
                    ],
                )
                .map_err(PersistError::from)?;
                Ok(Redelivery::RetryAfter { attempts, delay })
            } else {
                tx.execute(
                    "UPDATE queue_message SET status = ?1, last_error = ?2 WHERE message_id = ?3",
                    params![STATUS_PARKED, error, message_id as i64],
                )
                .map_err(PersistError::from)?;
                warn!(message_id, attempts, error, "message parked");
                Ok(Redelivery::Parked { attempts })
            }
        })
    }

    fn backlog(&self, topic: &str) -> QueueResult<u64> {
        let conn = self.db.connection()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_message WHERE topic = ?1 AND status = ?2",
                params![topic, STATUS_READY],
                |row| row.get(0),
            )
            .map_err(PersistError::from)?;
        Ok(count as u64)
    }
}
