//! SQLite connection pool with WAL journaling.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use super::{DatabaseConfig, PersistError, PersistResult};

struct Pool {
    path: PathBuf,
    config: DatabaseConfig,
    idle: Mutex<Vec<Connection>>,
}

impl Pool {
    fn connect(&self) -> PersistResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.config.max_idle_connections {
                idle.push(conn);
            }
        }
    }
}

/// Handle to an on-disk inventory database.
///
/// Cloning is cheap; every operation checks out its own connection, so
/// concurrent callers only contend on SQLite's own locks.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.pool.path).finish()
    }
}

impl Database {
    /// Opens or creates the database at `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        Self::open_with(path, DatabaseConfig::default())
    }

    /// Opens or creates the database at `path` and applies the schema.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL` on every connection.
    pub fn open_with(path: impl AsRef<Path>, config: DatabaseConfig) -> PersistResult<Self> {
        let pool = Pool {
            path: path.as_ref().to_path_buf(),
            config,
            idle: Mutex::new(Vec::new()),
        };
        let conn = pool.connect()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        pool.release(conn);
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.pool.path
    }

    /// Checks out a connection, opening a new one when none is idle.
    pub fn connection(&self) -> PersistResult<PooledConnection> {
        let reused = self
            .pool
            .idle
            .lock()
            .map_err(|_| PersistError::Message("connection pool poisoned".to_string()))?
            .pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.pool.connect()?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.pool),
        })
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction and commits on success.
    pub(crate) fn write<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<PersistError>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(PersistError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(PersistError::from)?;
        Ok(out)
    }

    /// Runs `f` inside a deferred transaction so every read sees one snapshot.
    pub(crate) fn read<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<PersistError>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(PersistError::from)?;
        let out = f(&tx)?;
        tx.finish().map_err(PersistError::from)?;
        Ok(out)
    }
}

/// Connection checked out of a [`Database`]; returned to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<Pool>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
