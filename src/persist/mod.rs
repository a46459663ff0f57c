/// Pooled SQLite database shared by the ledger, index, and queue.
pub mod sqlite;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use sqlite::{Database, PooledConnection};

/// Storage-layer failure.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// SQLite returned an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored payload failed to encode or decode.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Any other storage failure.
    #[error("{0}")]
    Message(String),
}

/// Result alias for storage calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Connection settings for [`Database`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Idle connections kept for reuse.
    pub max_idle_connections: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            max_idle_connections: 8,
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
