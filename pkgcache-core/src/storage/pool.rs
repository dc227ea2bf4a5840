//! Pooled SQLite connections and scoped transactions.
//!
//! Every transaction ends through `Transaction::finish` or, if the guard is
//! dropped early, an automatic rollback. Connections only go back to the
//! pool when no transaction is open on them.

use crate::error::{Result, ResultExt, StorageError};
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_POOL_SIZE: usize = 8;
/// A streaming copy between two classes on one pool holds a reader
/// connection while the writer checks out another.
pub const MIN_POOL_SIZE: usize = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ConnectionPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    // SQLite allows one writer at a time; queue writers here instead of
    // blocking runtime threads inside the busy handler.
    write_gate: Arc<AsyncMutex<()>>,
    size: usize,
}

impl ConnectionPool {
    pub fn open(path: impl Into<PathBuf>, size: usize) -> Result<Arc<Self>> {
        if size < MIN_POOL_SIZE {
            return Err(StorageError::Config(format!(
                "database pool size must be at least {}, got {}",
                MIN_POOL_SIZE, size
            )));
        }
        let pool = Self {
            path: path.into(),
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            write_gate: Arc::new(AsyncMutex::new(())),
            size,
        };

        let conn = pool
            .connect()
            .with_context(|| format!("opening database {}", pool.path.display()))?;
        pool.lock_idle()?.push(conn);
        Ok(Arc::new(pool))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections not currently checked out.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Ok(conn)
    }

    fn lock_idle(&self) -> Result<std::sync::MutexGuard<'_, Vec<Connection>>> {
        self.idle
            .lock()
            .map_err(|_| StorageError::Internal("connection pool lock poisoned".to_string()))
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Internal("connection pool closed".to_string()))?;

        let idle = self.lock_idle()?.pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.connect()?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Opens a transaction on a pooled connection.
    pub async fn begin(
        self: &Arc<Self>,
        mode: TxMode,
        operation: impl Into<String>,
    ) -> Result<Transaction> {
        let operation = operation.into();
        let write_guard = match mode {
            TxMode::Read => None,
            TxMode::Write => Some(Arc::clone(&self.write_gate).lock_owned().await),
        };
        let conn = self.acquire().await?;

        let sql = match mode {
            TxMode::Read => "BEGIN DEFERRED",
            TxMode::Write => "BEGIN IMMEDIATE",
        };
        conn.execute_batch(sql)
            .with_context(|| format!("beginning transaction for {}", operation))?;

        Ok(Transaction {
            conn,
            _write_guard: write_guard,
            operation,
            finished: false,
        })
    }
}

pub struct PooledConnection {
    // Only taken in `drop`.
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if !conn.is_autocommit() {
            tracing::debug!("Discarding pooled connection with an open transaction");
            return;
        }
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push(conn);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Read,
    Write,
}

/// A transaction that commits or rolls back exactly once.
pub struct Transaction {
    conn: PooledConnection,
    _write_guard: Option<OwnedMutexGuard<()>>,
    operation: String,
    finished: bool,
}

impl Transaction {
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Commits on `Ok` and rolls back on `Err`.
    ///
    /// A pending error always wins over a rollback failure. A commit
    /// failure is reported when there was no earlier error.
    pub fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        self.finished = true;
        match result {
            Ok(value) => match self.conn.execute_batch("COMMIT") {
                Ok(()) => {
                    tracing::debug!("Committed transaction for {}", self.operation);
                    Ok(value)
                }
                Err(err) => {
                    tracing::debug!("Commit failed for {}: {}", self.operation, err);
                    self.rollback();
                    Err(err).with_context(|| format!("committing {}", self.operation))
                }
            },
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn rollback(&mut self) {
        if self.conn.is_autocommit() {
            return;
        }
        match self.conn.execute_batch("ROLLBACK") {
            Ok(()) => tracing::debug!("Rolled back transaction for {}", self.operation),
            Err(err) => tracing::debug!("Rollback failed for {}: {}", self.operation, err),
        }
    }
}

impl Deref for Transaction {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for Transaction {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn pool(dir: &Path) -> Arc<ConnectionPool> {
        let pool = ConnectionPool::open(dir.join("pool.db"), 2).unwrap();
        pool.lock_idle()
            .unwrap()
            .last()
            .unwrap()
            .execute("CREATE TABLE IF NOT EXISTS items (name TEXT PRIMARY KEY)", [])
            .unwrap();
        pool
    }

    fn count(pool: &Arc<ConnectionPool>) -> i64 {
        let conn = pool.connect().unwrap();
        conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_finish_commits_ok() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pool = pool(temp_dir.path());

        let tx = pool.begin(TxMode::Write, "insert a").await.unwrap();
        let result = tx
            .execute("INSERT INTO items (name) VALUES (?1)", params!["a"])
            .map_err(StorageError::from);
        tx.finish(result).unwrap();

        assert_eq!(count(&pool), 1);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_finish_keeps_pending_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pool = pool(temp_dir.path());

        let tx = pool.begin(TxMode::Write, "insert b").await.unwrap();
        tx.execute("INSERT INTO items (name) VALUES (?1)", params!["b"])
            .unwrap();
        let err = tx
            .finish::<()>(Err(StorageError::InvalidRequest("boom".to_string())))
            .unwrap_err();

        assert!(matches!(err, StorageError::InvalidRequest(_)));
        assert_eq!(count(&pool), 0);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pool = pool(temp_dir.path());

        {
            let tx = pool.begin(TxMode::Write, "insert c").await.unwrap();
            tx.execute("INSERT INTO items (name) VALUES (?1)", params!["c"])
                .unwrap();
        }

        assert_eq!(count(&pool), 0);
        assert_eq!(pool.available(), 2);
        for conn in pool.lock_idle().unwrap().iter() {
            assert!(conn.is_autocommit());
        }
    }

    #[tokio::test]
    async fn test_writers_are_serialized() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pool = pool(temp_dir.path());

        let first = pool.begin(TxMode::Write, "first").await.unwrap();
        let second = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let tx = pool.begin(TxMode::Write, "second").await.unwrap();
                let result = tx
                    .execute("INSERT INTO items (name) VALUES (?1)", params!["second"])
                    .map(|_| ())
                    .map_err(StorageError::from);
                tx.finish(result).unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = first
            .execute("INSERT INTO items (name) VALUES (?1)", params!["first"])
            .map(|_| ())
            .map_err(StorageError::from);
        first.finish(result).unwrap();

        second.await.unwrap();
        assert_eq!(count(&pool), 2);
    }

    #[test]
    fn test_open_rejects_single_connection() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = ConnectionPool::open(temp_dir.path().join("pool.db"), 1)
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_released_connection_returns_to_idle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pool = pool(temp_dir.path());

        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 1);
        assert!(pool.lock_idle().unwrap().is_empty());
        drop(conn);

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.lock_idle().unwrap().len(), 1);
    }
}
