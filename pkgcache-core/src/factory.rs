use crate::chunks::ChunkUtils;
use crate::error::{Result, StorageError};
use crate::server::StorageServer;
use crate::storage::{
    ConnectionPool, DatabaseStorage, FileStorage, FileStorageArgs, S3Storage, S3StorageArgs,
};
use crate::types::StorageType;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builds one backend from a destination label and its parameters.
#[derive(Clone, Default)]
pub struct StorageBuilder {
    destination: Option<String>,
    class: Option<String>,
    chunker: Option<ChunkUtils>,
    file_root: Option<PathBuf>,
    cache_timeout: Option<Duration>,
    walk_timeout: Option<Duration>,
    s3: Option<S3StorageArgs>,
    database: Option<Arc<ConnectionPool>>,
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `file`, `s3` or `database` (`postgres` and `sqlite` are accepted too).
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn chunker(mut self, chunker: ChunkUtils) -> Self {
        self.chunker = Some(chunker);
        self
    }

    pub fn file_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.file_root = Some(root.into());
        self
    }

    pub fn cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = Some(timeout);
        self
    }

    pub fn walk_timeout(mut self, timeout: Duration) -> Self {
        self.walk_timeout = Some(timeout);
        self
    }

    pub fn s3(mut self, args: S3StorageArgs) -> Self {
        self.s3 = Some(args);
        self
    }

    pub fn database(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.database = Some(pool);
        self
    }

    fn resolve_destination(&self) -> Result<StorageType> {
        let destination = self
            .destination
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if destination.is_empty() {
            return Err(StorageError::Config(
                "storage destination cannot be empty".to_string(),
            ));
        }

        destination.parse::<StorageType>().map_err(|_| {
            StorageError::Config(format!("unsupported storage destination: {}", destination))
        })
    }

    fn resolve_class(&self) -> Result<String> {
        let class = self.class.as_deref().unwrap_or_default().trim().to_string();
        if class.is_empty() {
            return Err(StorageError::Config(
                "storage class cannot be empty".to_string(),
            ));
        }

        Ok(class)
    }

    pub async fn build(&self) -> Result<Arc<dyn StorageServer>> {
        let destination = self.resolve_destination()?;
        let chunker = self
            .chunker
            .clone()
            .unwrap_or_else(|| ChunkUtils::polling(crate::chunks::DEFAULT_CHUNK_SIZE));

        match destination {
            StorageType::File => {
                let root = self.file_root.clone().ok_or_else(|| {
                    StorageError::Config("file location is required for file storage".to_string())
                })?;

                let mut args = FileStorageArgs::new(root, chunker);
                if let Some(timeout) = self.cache_timeout {
                    args.cache_timeout = timeout;
                }
                if let Some(timeout) = self.walk_timeout {
                    args.walk_timeout = timeout;
                }
                Ok(Arc::new(FileStorage::new(args)?))
            }
            StorageType::S3 => {
                let args = self.s3.clone().ok_or_else(|| {
                    StorageError::Config("s3 settings are required for s3 storage".to_string())
                })?;
                Ok(Arc::new(S3Storage::new(args, chunker)?))
            }
            StorageType::Database => {
                let pool = self.database.clone().ok_or_else(|| {
                    StorageError::Config(
                        "a database pool is required for database storage".to_string(),
                    )
                })?;
                let class = self.resolve_class()?;
                Ok(Arc::new(DatabaseStorage::new(pool, class, chunker).await?))
            }
        }
    }
}
