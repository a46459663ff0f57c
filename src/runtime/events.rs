//! Indexing pipeline event stream payloads.

use crate::types::{MessageId, SourceItemId, StockId};

/// Events emitted by the indexer and its consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerEvent {
    /// Source item ids were published for reindex.
    Published {
        /// Queue message id.
        message_id: MessageId,
        /// Published ids.
        source_item_ids: Vec<SourceItemId>,
    },
    /// A consumer recomputed the pairs of a message and acked it.
    Reindexed {
        /// Queue message id.
        message_id: MessageId,
        /// Stocks whose rows were recomputed.
        stock_ids: Vec<StockId>,
    },
    /// A delivery failed and will be retried.
    RetryScheduled {
        /// Queue message id.
        message_id: MessageId,
        /// Deliveries so far.
        attempts: u32,
        /// Backoff before the next delivery.
        delay_ms: u64,
    },
    /// A delivery failed for the last time.
    Parked {
        /// Queue message id.
        message_id: MessageId,
        /// Deliveries made.
        attempts: u32,
    },
    /// A full rebuild finished.
    FullReindexed {
        /// Pairs recomputed.
        pairs: usize,
    },
}
