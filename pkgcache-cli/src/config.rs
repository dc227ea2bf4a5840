use pkgcache_core::chunks::{DEFAULT_CHUNK_POLL_TIMEOUT, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNK_ATTEMPTS};
use pkgcache_core::storage::file::{DEFAULT_CACHE_TIMEOUT, DEFAULT_WALK_TIMEOUT};
use pkgcache_core::storage::pool::DEFAULT_POOL_SIZE;
use pkgcache_core::{
    ChunkUtils, ConnectionPool, LocalChunkBroadcaster, MetadataStorage, Result, S3StorageArgs,
    SqliteCacheStore, StorageBuilder, StorageError, StorageServer, StorageType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
    #[serde(default = "default_chunk_poll_timeout_ms")]
    pub chunk_poll_timeout_ms: u64,
    #[serde(default = "default_chunk_max_attempts")]
    pub chunk_max_attempts: u32,
    #[serde(default = "default_cache_timeout_secs")]
    pub cache_timeout_secs: u64,
    #[serde(default = "default_walk_timeout_secs")]
    pub walk_timeout_secs: u64,
    /// SQLite file recording object usage. Unset disables bookkeeping.
    #[serde(default)]
    pub usage_db: Option<PathBuf>,
    pub classes: HashMap<String, ClassConfig>,
}

/// Storage for one class of objects (binaries, sources, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassConfig {
    pub destination: String,
    pub file: Option<FileConfig>,
    pub s3: Option<S3Config>,
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub location: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_poll_timeout_ms() -> u64 {
    DEFAULT_CHUNK_POLL_TIMEOUT.as_millis() as u64
}

fn default_chunk_max_attempts() -> u32 {
    DEFAULT_MAX_CHUNK_ATTEMPTS
}

fn default_cache_timeout_secs() -> u64 {
    DEFAULT_CACHE_TIMEOUT.as_secs()
}

fn default_walk_timeout_secs() -> u64 {
    DEFAULT_WALK_TIMEOUT.as_secs()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("PKGCACHE"))
            .build()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(config)
    }

    /// One coordinator for the whole process, so readers wake as soon as a
    /// local writer finishes a chunk.
    pub fn chunker(&self) -> ChunkUtils {
        let broadcaster = Arc::new(LocalChunkBroadcaster::default());
        ChunkUtils::new(self.chunk_size_bytes, broadcaster.clone(), broadcaster)
            .with_poll_timeout(Duration::from_millis(self.chunk_poll_timeout_ms))
            .with_max_attempts(self.chunk_max_attempts)
    }

    pub fn class(&self, name: &str) -> Result<&ClassConfig> {
        self.classes
            .get(name)
            .ok_or_else(|| StorageError::Config(format!("unknown storage class: {}", name)))
    }

    pub async fn build_storage(
        &self,
        name: &str,
        chunker: &ChunkUtils,
    ) -> Result<Arc<dyn StorageServer>> {
        let class = self.class(name)?;
        let mut builder = StorageBuilder::new()
            .destination(&class.destination)
            .class(name)
            .chunker(chunker.clone())
            .cache_timeout(Duration::from_secs(self.cache_timeout_secs))
            .walk_timeout(Duration::from_secs(self.walk_timeout_secs));

        if let Some(file) = &class.file {
            builder = builder.file_root(&file.location);
        }
        if let Some(s3) = &class.s3 {
            builder = builder.s3(S3StorageArgs {
                bucket: s3.bucket.clone(),
                prefix: s3.prefix.clone(),
                region: s3.region.clone(),
                endpoint: s3.endpoint.clone(),
                allow_http: s3.allow_http,
                access_key_id: s3.access_key_id.clone(),
                secret_access_key: s3.secret_access_key.clone(),
            });
        }
        if let Some(database) = &class.database {
            let pool = ConnectionPool::open(&database.path, database.pool_size)?;
            builder = builder.database(pool);
        }

        let storage = builder.build().await?;
        tracing::debug!(
            "Built {} storage for class {}: {}",
            storage.storage_type(),
            name,
            storage.dir()
        );

        match &self.usage_db {
            Some(path) => {
                let store = SqliteCacheStore::open(path)?;
                Ok(Arc::new(MetadataStorage::new(storage, Arc::new(store), name)))
            }
            None => Ok(storage),
        }
    }

    pub fn destination(&self, name: &str) -> Result<StorageType> {
        self.class(name)?
            .destination
            .parse()
            .map_err(StorageError::Config)
    }
}
