use crate::error::{Result, StorageError};
use crate::resolver::Resolver;
use crate::types::{FoundObject, ObjectInfo, ObjectKey, StorageType, StoredItem, Usage};
use async_trait::async_trait;
use std::any::Any;

/// Operations every storage backend provides.
///
/// "Not found" is reported as `Ok(None)`, never as an error.
#[async_trait]
pub trait StorageServer: Send + Sync + 'static {
    /// Looks up an object without opening its data.
    async fn check(&self, dir: &str, address: &str) -> Result<Option<ObjectInfo>>;

    /// Opens an object, routing to the chunk coordinator for chunked keys.
    async fn get(&self, dir: &str, address: &str) -> Result<Option<FoundObject>>;

    /// Writes a whole object. With an empty `dir` and `address`, the key
    /// returned by the resolver decides where the object lands.
    async fn put(
        &self,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
    ) -> Result<ObjectKey>;

    /// Writes a chunked object of a known size at a known key.
    async fn put_chunked(
        &self,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
        size: u64,
    ) -> Result<ObjectKey>;

    /// Removes an object. Removing an absent key succeeds.
    async fn remove(&self, dir: &str, address: &str) -> Result<()>;

    async fn enumerate(&self) -> Result<Vec<StoredItem>>;

    /// Moves an object to `dest`, leaving the source absent on success.
    async fn move_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()>;

    async fn copy_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()>;

    /// Refreshes cached attributes for a key.
    async fn flush(&self, _dir: &str, _address: &str) -> Result<()> {
        Ok(())
    }

    /// Human-readable address of a key. Performs no I/O.
    fn locate(&self, dir: &str, address: &str) -> String;

    fn dir(&self) -> String;

    fn storage_type(&self) -> StorageType;

    async fn calculate_usage(&self) -> Result<Usage>;

    /// The innermost concrete backend, unwrapping any decorators.
    fn base(&self) -> &dyn StorageServer;

    fn as_any(&self) -> &dyn Any;
}

/// Final key of a whole-object put.
pub(crate) fn resolve_final_key(
    dir: &str,
    address: &str,
    resolved: Option<ObjectKey>,
) -> Result<ObjectKey> {
    if !dir.is_empty() || !address.is_empty() {
        return Ok(ObjectKey::new(dir, address));
    }

    match resolved {
        Some(key) if !key.address.is_empty() => Ok(key),
        _ => Err(StorageError::InvalidRequest(
            "resolver did not supply a key for an unaddressed put".to_string(),
        )),
    }
}

pub(crate) fn ensure_chunked_put(address: &str, size: u64) -> Result<()> {
    if address.is_empty() {
        return Err(StorageError::InvalidRequest(
            "chunked puts require a pre-assigned address".to_string(),
        ));
    }
    if size == 0 {
        return Err(StorageError::InvalidRequest(
            "chunked puts require a known, non-zero size".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn chunk_set_conflict(dir: &str, address: &str) -> StorageError {
    StorageError::InvalidRequest(format!(
        "{} already holds a chunked object",
        ObjectKey::new(dir, address)
    ))
}
