//! Access bookkeeping around any backend.
//!
//! `MetadataStorage` records successful reads as "last used" and successful
//! writes as "exists" in a `CacheStore`. Everything else is forwarded
//! untouched, and `base()` still reaches the wrapped backend.

use crate::error::{Result, ResultExt, StorageError};
use crate::resolver::Resolver;
use crate::server::StorageServer;
use crate::types::{
    FoundObject, ObjectInfo, ObjectKey, StorageType, StoredItem, Usage, join_key,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::any::Any;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Usage store the decorator reports to.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn cache_object_ensure_exists(&self, cache: &str, key: &str) -> Result<()>;

    async fn cache_object_mark_use(&self, cache: &str, key: &str, at: DateTime<Utc>)
    -> Result<()>;
}

pub struct MetadataStorage {
    inner: Arc<dyn StorageServer>,
    store: Arc<dyn CacheStore>,
    name: String,
}

impl MetadataStorage {
    pub fn new(
        inner: Arc<dyn StorageServer>,
        store: Arc<dyn CacheStore>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self, key: &ObjectKey) -> Result<()> {
        let location = key.location();
        self.store
            .cache_object_ensure_exists(&self.name, &location)
            .await
            .with_context(|| format!("recording {} in {}", location, self.name))
    }
}

#[async_trait]
impl StorageServer for MetadataStorage {
    async fn check(&self, dir: &str, address: &str) -> Result<Option<ObjectInfo>> {
        self.inner.check(dir, address).await
    }

    async fn get(&self, dir: &str, address: &str) -> Result<Option<FoundObject>> {
        let found = self.inner.get(dir, address).await?;
        if found.is_some() {
            let key = join_key(&[dir, address]);
            self.store
                .cache_object_mark_use(&self.name, &key, Utc::now())
                .await
                .with_context(|| format!("marking use of {} in {}", key, self.name))?;
        }
        Ok(found)
    }

    async fn put(
        &self,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
    ) -> Result<ObjectKey> {
        let key = self.inner.put(resolver, dir, address).await?;
        self.ensure_exists(&key).await?;
        Ok(key)
    }

    async fn put_chunked(
        &self,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
        size: u64,
    ) -> Result<ObjectKey> {
        let key = self.inner.put_chunked(resolver, dir, address, size).await?;
        self.ensure_exists(&key).await?;
        Ok(key)
    }

    async fn remove(&self, dir: &str, address: &str) -> Result<()> {
        self.inner.remove(dir, address).await
    }

    async fn enumerate(&self) -> Result<Vec<StoredItem>> {
        self.inner.enumerate().await
    }

    async fn move_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()> {
        self.inner.move_to(dir, address, dest).await
    }

    async fn copy_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()> {
        self.inner.copy_to(dir, address, dest).await
    }

    async fn flush(&self, dir: &str, address: &str) -> Result<()> {
        self.inner.flush(dir, address).await
    }

    fn locate(&self, dir: &str, address: &str) -> String {
        self.inner.locate(dir, address)
    }

    fn dir(&self) -> String {
        self.inner.dir()
    }

    fn storage_type(&self) -> StorageType {
        self.inner.storage_type()
    }

    async fn calculate_usage(&self) -> Result<Usage> {
        self.inner.calculate_usage().await
    }

    fn base(&self) -> &dyn StorageServer {
        self.inner.base()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `CacheStore` kept in a SQLite table.
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
}

impl SqliteCacheStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_objects (
                cache_name TEXT NOT NULL,
                key TEXT NOT NULL,
                last_used TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (cache_name, key)
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Internal("cache store lock poisoned".to_string()))
    }

    pub fn contains(&self, cache: &str, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM cache_objects WHERE cache_name = ?1 AND key = ?2",
                params![cache, key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn last_used(&self, cache: &str, key: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let last_used: Option<Option<String>> = conn
            .query_row(
                "SELECT last_used FROM cache_objects WHERE cache_name = ?1 AND key = ?2",
                params![cache, key],
                |row| row.get(0),
            )
            .optional()?;

        match last_used.flatten() {
            Some(value) => {
                let at = DateTime::parse_from_rfc3339(&value).map_err(|e| {
                    StorageError::Internal(format!("invalid timestamp {}: {}", value, e))
                })?;
                Ok(Some(at.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn cache_object_ensure_exists(&self, cache: &str, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO cache_objects (cache_name, key, created_at)
             VALUES (?1, ?2, ?3)",
            params![cache, key, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn cache_object_mark_use(
        &self,
        cache: &str,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let at = at.to_rfc3339();
        conn.execute(
            "INSERT INTO cache_objects (cache_name, key, last_used, created_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (cache_name, key) DO UPDATE SET last_used = excluded.last_used",
            params![cache, key, at],
        )?;
        tracing::debug!("Marked use of {} in {}", key, cache);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::ChunkUtils;
    use crate::resolver::BytesResolver;
    use crate::storage::file::{FileStorage, FileStorageArgs};
    use tokio::io::AsyncReadExt;

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn cache_object_ensure_exists(&self, _cache: &str, _key: &str) -> Result<()> {
            Err(StorageError::Internal("store offline".to_string()))
        }

        async fn cache_object_mark_use(
            &self,
            _cache: &str,
            _key: &str,
            _at: DateTime<Utc>,
        ) -> Result<()> {
            Err(StorageError::Internal("store offline".to_string()))
        }
    }

    fn file_storage(root: &Path) -> Arc<dyn StorageServer> {
        let args = FileStorageArgs::new(root, ChunkUtils::polling(4));
        Arc::new(FileStorage::new(args).unwrap())
    }

    #[tokio::test]
    async fn test_put_and_get_are_recorded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteCacheStore::in_memory().unwrap());
        let storage = MetadataStorage::new(
            file_storage(temp_dir.path()),
            store.clone(),
            "binaries",
        );

        let mut resolver = BytesResolver::new(&b"hello"[..]);
        storage.put(&mut resolver, "d", "a").await.unwrap();
        assert!(store.contains("binaries", "d/a").unwrap());
        assert!(store.last_used("binaries", "d/a").unwrap().is_none());

        let found = storage.get("d", "a").await.unwrap().unwrap();
        let mut body = Vec::new();
        let mut reader = found.reader;
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello");
        assert!(store.last_used("binaries", "d/a").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_chunked_put_and_missing_get() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteCacheStore::in_memory().unwrap());
        let storage = MetadataStorage::new(
            file_storage(temp_dir.path()),
            store.clone(),
            "binaries",
        );

        let mut resolver = BytesResolver::new(&b"0123456789"[..]);
        storage
            .put_chunked(&mut resolver, "d", "big", 10)
            .await
            .unwrap();
        assert!(store.contains("binaries", "d/big").unwrap());

        assert!(storage.get("d", "missing").await.unwrap().is_none());
        assert!(!store.contains("binaries", "d/missing").unwrap());
    }

    #[tokio::test]
    async fn test_store_failures_propagate() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = MetadataStorage::new(
            file_storage(temp_dir.path()),
            Arc::new(FailingStore),
            "binaries",
        );

        let mut resolver = BytesResolver::new(&b"hello"[..]);
        let err = storage.put(&mut resolver, "d", "a").await.unwrap_err();
        assert!(matches!(err.root(), StorageError::Internal(_)));
        assert!(storage.check("d", "a").await.unwrap().is_some());
        assert!(storage.get("d", "a").await.is_err());
    }

    #[tokio::test]
    async fn test_base_reaches_wrapped_backend() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteCacheStore::in_memory().unwrap());
        let storage = MetadataStorage::new(file_storage(temp_dir.path()), store, "binaries");

        assert!(storage.base().as_any().downcast_ref::<FileStorage>().is_some());
        assert!(storage.as_any().downcast_ref::<FileStorage>().is_none());
        assert_eq!(storage.storage_type(), StorageType::File);
    }
}
