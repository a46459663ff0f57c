//! Queue consumers that apply published source item changes to the index.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    core::index::SourceQuantityIndex,
    persist::PersistResult,
    queue::{MessageQueue, QueueResult, Redelivery, RetryPolicy},
    types::{MessageId, SourceItemId, StockId},
};

use super::{
    events::IndexerEvent,
    indexer::{IndexStates, TOPIC_SOURCE_ITEMS_INDEX},
};

/// Worker pool settings for [`spawn_index_consumers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Concurrent workers; at least one is always started.
    pub workers: usize,
    /// Idle wait between empty claims.
    pub poll_interval_ms: u64,
    /// How long a claimed message stays invisible to other workers.
    pub lease_ms: u64,
    /// Redelivery limits for failed messages.
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 50,
            lease_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The pairs were recomputed and the message acked.
    Reindexed {
        /// Processed message.
        message_id: MessageId,
        /// Stocks whose rows were recomputed.
        stock_ids: Vec<StockId>,
    },
    /// The delivery failed and will come back after `delay`.
    RetryScheduled {
        /// Failed message.
        message_id: MessageId,
        /// Deliveries so far.
        attempts: u32,
        /// Backoff before redelivery.
        delay: Duration,
    },
    /// The delivery failed for the last time.
    Parked {
        /// Failed message.
        message_id: MessageId,
        /// Deliveries made.
        attempts: u32,
    },
}

/// Recomputes the index for published source item ids.
#[derive(Clone)]
pub struct SourceItemsConsumer {
    index: SourceQuantityIndex,
    queue: Arc<dyn MessageQueue>,
    states: IndexStates,
    events: broadcast::Sender<IndexerEvent>,
    config: ConsumerConfig,
}

impl std::fmt::Debug for SourceItemsConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceItemsConsumer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SourceItemsConsumer {
    pub(crate) fn new(
        index: SourceQuantityIndex,
        queue: Arc<dyn MessageQueue>,
        states: IndexStates,
        events: broadcast::Sender<IndexerEvent>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            index,
            queue,
            states,
            events,
            config,
        }
    }

    /// Worker pool settings.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Recomputes the pairs fed by `ids`. Safe to run repeatedly.
    pub fn handle(&self, ids: &[SourceItemId]) -> PersistResult<Vec<StockId>> {
        let stocks = self.index.affected_stocks(ids)?;
        self.states.begin(&stocks, ids);
        match self.index.reindex_source_items(ids) {
            Ok(reindexed) => {
                self.states.finish(&stocks, &[]);
                Ok(reindexed)
            }
            Err(err) => {
                self.states.finish(&stocks, ids);
                Err(err)
            }
        }
    }

    /// Claims and processes one message. `Ok(None)` when nothing is ready.
    pub fn process_next(&self) -> QueueResult<Option<ConsumeOutcome>> {
        let lease = Duration::from_millis(self.config.lease_ms);
        let Some(envelope) = self.queue.claim(TOPIC_SOURCE_ITEMS_INDEX, lease, &self.config.retry)? else {
            return Ok(None);
        };
        let message_id = envelope.message_id;

        let result = serde_json::from_slice::<Vec<SourceItemId>>(&envelope.body)
            .map_err(|err| format!("malformed body: {err}"))
            .and_then(|ids| self.handle(&ids).map_err(|err| err.to_string()));

        let outcome = match result {
            Ok(stock_ids) => {
                self.queue.ack(message_id)?;
                debug!(message_id, stocks = ?stock_ids, "source item reindex consumed");
                let _ = self.events.send(IndexerEvent::Reindexed {
                    message_id,
                    stock_ids: stock_ids.clone(),
                });
                ConsumeOutcome::Reindexed {
                    message_id,
                    stock_ids,
                }
            }
            Err(error) => match self.queue.nack(message_id, &error, &self.config.retry)? {
                Redelivery::RetryAfter { attempts, delay } => {
                    warn!(message_id, attempts, error = %error, "source item reindex failed; retrying");
                    let _ = self.events.send(IndexerEvent::RetryScheduled {
                        message_id,
                        attempts,
                        delay_ms: delay.as_millis() as u64,
                    });
                    ConsumeOutcome::RetryScheduled {
                        message_id,
                        attempts,
                        delay,
                    }
                }
                Redelivery::Parked { attempts } => {
                    let _ = self.events.send(IndexerEvent::Parked {
                        message_id,
                        attempts,
                    });
                    ConsumeOutcome::Parked {
                        message_id,
                        attempts,
                    }
                }
            },
        };
        Ok(Some(outcome))
    }

    /// Processes messages until none is ready. Returns how many were handled.
    pub fn drain(&self) -> QueueResult<usize> {
        let mut handled = 0;
        while self.process_next()?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }
}

/// Running consumer pool.
pub struct ConsumerHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    queue: Arc<dyn MessageQueue>,
}

impl ConsumerHandle {
    /// Ready messages not yet consumed.
    pub fn lag(&self) -> QueueResult<u64> {
        self.queue.backlog(TOPIC_SOURCE_ITEMS_INDEX)
    }

    /// Number of running workers.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker and waits for them to stop after their current message.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("index consumers stopped");
    }
}

/// Starts `config.workers` tasks that consume the reindex topic.
///
/// Must be called inside a tokio runtime.
pub fn spawn_index_consumers(consumer: SourceItemsConsumer) -> ConsumerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let queue = Arc::clone(&consumer.queue);
    let count = consumer.config.workers.max(1);
    let poll = Duration::from_millis(consumer.config.poll_interval_ms);
    let consumer = Arc::new(consumer);

    let workers = (0..count)
        .map(|worker| {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&consumer),
                shutdown_rx.clone(),
                poll,
            ))
        })
        .collect();
    info!(workers = count, "index consumers started");

    ConsumerHandle {
        shutdown_tx,
        workers,
        queue,
    }
}

async fn worker_loop(
    worker: usize,
    consumer: Arc<SourceItemsConsumer>,
    mut shutdown_rx: watch::Receiver<bool>,
    poll: Duration,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let job = Arc::clone(&consumer);
        let processed = match tokio::task::spawn_blocking(move || job.process_next()).await {
            Ok(Ok(outcome)) => outcome.is_some(),
            Ok(Err(err)) => {
                warn!(worker, error = %err, "index consumer poll failed");
                false
            }
            Err(err) => {
                warn!(worker, error = %err, "index consumer task panicked");
                false
            }
        };
        if processed {
            continue;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }
    debug!(worker, "index consumer exiting");
}
