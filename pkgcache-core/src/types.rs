use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Fixed name of the descriptor stored next to the chunks of a chunked object.
pub const CHUNK_INFO_NAME: &str = "info.json";

/// Internal prefix for in-flight uploads; never reported by `enumerate`.
pub const STAGING_DIR: &str = ".staging";

/// Streamed object content.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Persisted descriptor of a chunked object (`info.json`).
///
/// The JSON field names are a durable format shared with other readers of
/// the same storage, so they must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunksInfo {
    pub chunk_size: u64,
    pub file_size: u64,
    pub mod_time: DateTime<Utc>,
    pub num_chunks: u64,
    pub complete: bool,
}

impl ChunksInfo {
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        Self {
            chunk_size,
            file_size,
            mod_time: Utc::now(),
            num_chunks: chunk_count(file_size, chunk_size),
            complete: false,
        }
    }
}

pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

/// Name of the 1-based chunk `index` inside a chunk directory.
pub fn chunk_name(index: u64) -> String {
    format!("{:08}", index)
}

pub fn is_chunk_name(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}

/// Joins key segments with "/", skipping empty ones.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Splits a location into `(dir, address)` at the last "/".
pub fn split_key(location: &str) -> (String, String) {
    match location.rsplit_once('/') {
        Some((dir, address)) => (dir.to_string(), address.to_string()),
        None => (String::new(), location.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ObjectKey {
    pub dir: String,
    pub address: String,
}

impl ObjectKey {
    pub fn new(dir: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            address: address.into(),
        }
    }

    pub fn location(&self) -> String {
        join_key(&[&self.dir, &self.address])
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location())
    }
}

/// One logical object as reported by `enumerate`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoredItem {
    pub dir: String,
    pub address: String,
    pub chunked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    /// Set when the object is stored as a chunk set.
    pub chunked: Option<ChunksInfo>,
    pub size: u64,
    pub mod_time: Option<DateTime<Utc>>,
}

impl ObjectInfo {
    pub fn plain(size: u64, mod_time: Option<DateTime<Utc>>) -> Self {
        Self {
            chunked: None,
            size,
            mod_time,
        }
    }

    pub fn from_chunks(info: ChunksInfo) -> Self {
        Self {
            size: info.file_size,
            mod_time: Some(info.mod_time),
            chunked: Some(info),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked.is_some()
    }
}

/// An opened object.
pub struct FoundObject {
    pub reader: ObjectReader,
    pub info: ObjectInfo,
}

impl fmt::Debug for FoundObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FoundObject")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Signal exchanged between chunk writers and waiting readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkNotification {
    /// Chunk directory scoped to its backend (`<backend dir>#dir/address`).
    pub key: String,
    pub chunk: u64,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    File,
    S3,
    Database,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::File => "file",
            StorageType::S3 => "s3",
            StorageType::Database => "database",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageType::File),
            "s3" => Ok(StorageType::S3),
            "database" | "postgres" | "postgresql" | "sqlite" => Ok(StorageType::Database),
            other => Err(format!("unsupported storage type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub size_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub calculation_time: Duration,
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size: {} bytes, free: {} bytes, used: {} bytes (calculated in {:?})",
            self.size_bytes, self.free_bytes, self.used_bytes, self.calculation_time
        )
    }
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
