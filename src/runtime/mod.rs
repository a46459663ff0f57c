//! Asynchronous indexing pipeline: producer, consumers, and event stream.

/// Consumer worker pool and handle.
pub mod consumer;
/// Event stream types emitted by the pipeline.
pub mod events;
/// Source item indexer and per-stock index state.
pub mod indexer;
