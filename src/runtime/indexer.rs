//! Producer side of the source item reindex pipeline.
//!
//! Stock states are tracked per process: a consumer running elsewhere on the
//! same queue does not move them back to clean.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    core::index::{SourceQuantityIndex, reindex_in, stocks_in},
    persist::PersistError,
    queue::{MessageQueue, QueueError, QueueResult},
    types::{MessageId, SourceItemId, StockId},
};

use super::{
    consumer::{ConsumerConfig, SourceItemsConsumer},
    events::IndexerEvent,
};

/// Topic carrying lists of changed source item ids.
pub const TOPIC_SOURCE_ITEMS_INDEX: &str = "inventory.indexer.sourceItem";

/// Whether partial reindex runs inline or through the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerMode {
    /// Recompute before returning.
    Sync,
    /// Publish ids and let a consumer recompute.
    #[default]
    Async,
}

/// Freshness of one stock's indexed rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StockIndexState {
    /// No known pending change.
    #[default]
    Clean,
    /// Changes published but not yet picked up.
    Dirty {
        /// Source item ids waiting for a consumer.
        pending: BTreeSet<SourceItemId>,
    },
    /// A consumer is recomputing; `pending` arrived after it started.
    Reindexing {
        /// Source item ids published during the recompute.
        pending: BTreeSet<SourceItemId>,
    },
}

/// Per-stock state shared by the producer and its consumers.
#[derive(Debug, Clone, Default)]
pub(crate) struct IndexStates {
    inner: Arc<Mutex<HashMap<StockId, StockIndexState>>>,
}

impl IndexStates {
    pub(crate) fn get(&self, stock_id: StockId) -> StockIndexState {
        self.lock().get(&stock_id).cloned().unwrap_or_default()
    }

    pub(crate) fn mark_dirty(&self, stocks: &[StockId], ids: &[SourceItemId]) {
        let mut states = self.lock();
        for stock_id in stocks {
            let state = states.entry(*stock_id).or_default();
            match *state {
                StockIndexState::Clean => {
                    *state = StockIndexState::Dirty {
                        pending: ids.iter().copied().collect(),
                    };
                }
                StockIndexState::Dirty { ref mut pending }
                | StockIndexState::Reindexing { ref mut pending } => {
                    pending.extend(ids.iter().copied());
                }
            }
        }
    }

    /// Withdraws `ids` after their publish failed or was rolled back.
    pub(crate) fn unmark(&self, stocks: &[StockId], ids: &[SourceItemId]) {
        let mut states = self.lock();
        for stock_id in stocks {
            let Some(state) = states.get_mut(stock_id) else {
                continue;
            };
            *state = match std::mem::take(state) {
                StockIndexState::Dirty { mut pending } => {
                    for id in ids {
                        pending.remove(id);
                    }
                    if pending.is_empty() {
                        StockIndexState::Clean
                    } else {
                        StockIndexState::Dirty { pending }
                    }
                }
                StockIndexState::Reindexing { mut pending } => {
                    for id in ids {
                        pending.remove(id);
                    }
                    StockIndexState::Reindexing { pending }
                }
                StockIndexState::Clean => StockIndexState::Clean,
            };
        }
    }

    pub(crate) fn begin(&self, stocks: &[StockId], ids: &[SourceItemId]) {
        let mut states = self.lock();
        for stock_id in stocks {
            let state = states.entry(*stock_id).or_default();
            let mut pending = match std::mem::take(state) {
                StockIndexState::Clean => BTreeSet::new(),
                StockIndexState::Dirty { pending } | StockIndexState::Reindexing { pending } => pending,
            };
            for id in ids {
                pending.remove(id);
            }
            *state = StockIndexState::Reindexing { pending };
        }
    }

    pub(crate) fn finish(&self, stocks: &[StockId], failed: &[SourceItemId]) {
        let mut states = self.lock();
        for stock_id in stocks {
            let state = states.entry(*stock_id).or_default();
            *state = match std::mem::take(state) {
                StockIndexState::Reindexing { mut pending } => {
                    pending.extend(failed.iter().copied());
                    if pending.is_empty() {
                        StockIndexState::Clean
                    } else {
                        StockIndexState::Dirty { pending }
                    }
                }
                other => other,
            };
        }
    }

    pub(crate) fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StockId, StockIndexState>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Indexer failure surfaced to the triggering write.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// The change could not be published; the index would go stale.
    #[error("publish failed: {0}")]
    Publish(#[from] QueueError),
    /// Storage failure.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The id list could not be encoded.
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reindex work done inside a source item write, settled once it commits.
#[derive(Debug)]
pub(crate) struct StagedReindex {
    stocks: Vec<StockId>,
    ids: Vec<SourceItemId>,
    message_id: Option<MessageId>,
}

/// Entry point for full and partial reindex of source items.
#[derive(Clone)]
pub struct SourceItemIndexer {
    index: SourceQuantityIndex,
    queue: Arc<dyn MessageQueue>,
    mode: IndexerMode,
    states: IndexStates,
    events: broadcast::Sender<IndexerEvent>,
}

impl std::fmt::Debug for SourceItemIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceItemIndexer")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SourceItemIndexer {
    /// Creates an indexer publishing to `queue` in `mode`.
    pub fn new(index: SourceQuantityIndex, queue: Arc<dyn MessageQueue>, mode: IndexerMode) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            index,
            queue,
            mode,
            states: IndexStates::default(),
            events,
        }
    }

    /// Configured mode.
    pub fn mode(&self) -> IndexerMode {
        self.mode
    }

    /// Subscribes to pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.events.subscribe()
    }

    /// Current freshness of `stock_id`, as seen by this process.
    ///
    /// Only consumers built from this indexer report back; a stock consumed
    /// by another process stays dirty here until [`Self::execute_full`].
    pub fn state(&self, stock_id: StockId) -> StockIndexState {
        self.states.get(stock_id)
    }

    /// Rebuilds every (sku, stock) pair synchronously.
    pub fn execute_full(&self) -> Result<usize, IndexerError> {
        let pairs = self.index.rebuild_all()?;
        self.states.reset();
        info!(pairs, "full reindex finished");
        let _ = self.events.send(IndexerEvent::FullReindexed { pairs });
        Ok(pairs)
    }

    /// Reindexes a single source item.
    pub fn execute_row(&self, id: SourceItemId) -> Result<(), IndexerError> {
        self.execute_list(&[id])
    }

    /// Reindexes the pairs fed by `ids`.
    ///
    /// In async mode this only publishes `ids` and returns; a failed publish
    /// is returned so the caller can abort.
    pub fn execute_list(&self, ids: &[SourceItemId]) -> Result<(), IndexerError> {
        if ids.is_empty() {
            return Ok(());
        }

        match self.mode {
            IndexerMode::Sync => {
                let stocks = self.index.reindex_source_items(ids)?;
                debug!(count = ids.len(), stocks = ?stocks, "source items reindexed inline");
            }
            IndexerMode::Async => {
                let stocks = self.index.affected_stocks(ids)?;
                let message_id =
                    self.publish_ids(&stocks, ids, |body| self.queue.publish(TOPIC_SOURCE_ITEMS_INDEX, body))?;
                self.announce(message_id, ids);
            }
        }
        Ok(())
    }

    /// Runs the reindex step of a source item write on its open transaction.
    ///
    /// Sync mode recomputes the pairs in place; async mode publishes through
    /// [`MessageQueue::publish_in`]. Either way a rollback undoes it, after
    /// which the caller passes the result to [`Self::abandon`].
    pub(crate) fn stage(&self, conn: &Connection, ids: &[SourceItemId]) -> Result<StagedReindex, IndexerError> {
        let mut staged = StagedReindex {
            stocks: Vec::new(),
            ids: ids.to_vec(),
            message_id: None,
        };
        if ids.is_empty() {
            return Ok(staged);
        }

        match self.mode {
            IndexerMode::Sync => staged.stocks = reindex_in(conn, ids)?,
            IndexerMode::Async => {
                staged.stocks = stocks_in(conn, ids)?;
                staged.message_id = Some(self.publish_ids(&staged.stocks, ids, |body| {
                    self.queue.publish_in(conn, TOPIC_SOURCE_ITEMS_INDEX, body)
                })?);
            }
        }
        Ok(staged)
    }

    pub(crate) fn committed(&self, staged: StagedReindex) {
        match staged.message_id {
            Some(message_id) => self.announce(message_id, &staged.ids),
            None if !staged.ids.is_empty() => {
                debug!(count = staged.ids.len(), stocks = ?staged.stocks, "source items reindexed inline");
            }
            None => {}
        }
    }

    pub(crate) fn abandon(&self, staged: StagedReindex) {
        if let Some(message_id) = staged.message_id {
            self.states.unmark(&staged.stocks, &staged.ids);
            warn!(message_id, count = staged.ids.len(), "source item reindex rolled back");
        }
    }

    fn publish_ids(
        &self,
        stocks: &[StockId],
        ids: &[SourceItemId],
        send: impl FnOnce(&[u8]) -> QueueResult<MessageId>,
    ) -> Result<MessageId, IndexerError> {
        let body = serde_json::to_vec(ids)?;
        // Marked first so a consumer finishing before we return still clears it.
        self.states.mark_dirty(stocks, ids);
        send(&body).map_err(|err| {
            self.states.unmark(stocks, ids);
            error!(count = ids.len(), error = %err, "source item reindex publish failed");
            IndexerError::from(err)
        })
    }

    fn announce(&self, message_id: MessageId, ids: &[SourceItemId]) {
        debug!(message_id, count = ids.len(), "source item reindex published");
        let _ = self.events.send(IndexerEvent::Published {
            message_id,
            source_item_ids: ids.to_vec(),
        });
    }

    /// Builds a consumer sharing this indexer's queue, index, and state.
    pub fn consumer(&self, config: ConsumerConfig) -> SourceItemsConsumer {
        SourceItemsConsumer::new(
            self.index.clone(),
            Arc::clone(&self.queue),
            self.states.clone(),
            self.events.clone(),
            config,
        )
    }
}
