//! Pkgcache Core - multi-backend storage for packages and build artifacts
//!
//! One backend contract, three implementations:
//! - local or network filesystems
//! - S3-compatible object stores
//! - SQLite large objects
//!
//! Large uploads are split into numbered chunks next to an `info.json`, so
//! readers can stream an object while it is still being written.

pub mod chunks;
pub mod error;
pub mod factory;
pub mod metadata;
pub mod resolver;
pub mod server;
pub mod storage;
pub mod transfer;
pub mod types;

pub use chunks::{
    ChunkNotifier, ChunkUtils, ChunkWaiter, LocalChunkBroadcaster, NoopNotifier, PollingWaiter,
    filter_chunks,
};
pub use error::{Result, ResultExt, StorageError};
pub use factory::StorageBuilder;
pub use metadata::{CacheStore, MetadataStorage, SqliteCacheStore};
pub use resolver::{BytesResolver, ContentAddressedResolver, ReaderResolver, Resolver};
pub use server::StorageServer;
pub use storage::{
    ConnectionPool, DatabaseStorage, FileStorage, FileStorageArgs, S3Storage, S3StorageArgs,
};
pub use types::{
    ChunkNotification, ChunksInfo, FoundObject, ObjectInfo, ObjectKey, ObjectReader,
    StorageType, StoredItem, Usage, compute_hash,
};
