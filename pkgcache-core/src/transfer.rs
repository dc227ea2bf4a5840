//! Generic rung of the move/copy ladder.
//!
//! Backends try their own server-side copy or move first when the
//! destination is the same technology, and fall back to these functions,
//! which stream the object through the caller.

use crate::error::{Result, ResultExt, StorageError};
use crate::resolver::ReaderResolver;
use crate::server::StorageServer;
use crate::types::join_key;
use std::future::Future;

/// Streams `dir/address` from `source` into `dest`, keeping the chunked
/// shape of the object.
pub async fn copy_streaming(
    source: &dyn StorageServer,
    dir: &str,
    address: &str,
    dest: &dyn StorageServer,
) -> Result<()> {
    let key = join_key(&[dir, address]);
    let found = source
        .get(dir, address)
        .await
        .with_context(|| format!("opening {} for copy", key))?
        .ok_or_else(|| StorageError::NotFound(key.clone()))?;

    let mut resolver = ReaderResolver::new(found.reader);
    match found.info.chunked {
        Some(info) => {
            dest.put_chunked(&mut resolver, dir, address, info.file_size)
                .await
                .with_context(|| format!("copying chunked object {} to {}", key, dest.dir()))?;
        }
        None => {
            dest.put(&mut resolver, dir, address)
                .await
                .with_context(|| format!("copying {} to {}", key, dest.dir()))?;
        }
    }
    Ok(())
}

/// Copies then removes the source. The source is left intact if the copy
/// fails.
pub async fn move_streaming(
    source: &dyn StorageServer,
    dir: &str,
    address: &str,
    dest: &dyn StorageServer,
) -> Result<()> {
    copy_streaming(source, dir, address, dest).await?;
    source
        .remove(dir, address)
        .await
        .with_context(|| format!("removing {} after move", join_key(&[dir, address])))
}

/// Runs the native attempt if there is one and falls back to `fallback` on
/// failure. Native failures are only logged.
pub(crate) async fn with_fallback<N, F>(
    operation: &str,
    key: &str,
    native: Option<N>,
    fallback: F,
) -> Result<()>
where
    N: Future<Output = Result<()>>,
    F: Future<Output = Result<()>>,
{
    if let Some(native) = native {
        match native.await {
            Ok(()) => return Ok(()),
            Err(err) => tracing::debug!(
                "Native {} of {} failed, falling back to streaming: {}",
                operation,
                key,
                err
            ),
        }
    }
    fallback.await
}
