//! Chunked storage on top of any backend's whole-object primitives.
//!
//! A chunked object `dir/address` is a directory-like key holding
//! `info.json` plus chunks `00000001`, `00000002`, ... Writers publish
//! chunks in order and flip `complete` in `info.json` last. Readers may
//! start as soon as `info.json` exists and wait for missing chunks.

pub mod notify;

pub use notify::{ChunkNotifier, ChunkWaiter, LocalChunkBroadcaster, NoopNotifier, PollingWaiter};

use crate::error::{Result, StorageError};
use crate::resolver::{BytesResolver, Resolver};
use crate::server::StorageServer;
use crate::types::{
    CHUNK_INFO_NAME, ChunkNotification, ChunksInfo, FoundObject, ObjectInfo, ObjectKey,
    ObjectReader, StoredItem, chunk_name, join_key, split_key,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, Take};
use tokio_util::io::{ReaderStream, StreamReader};

pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_CHUNK_POLL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CHUNK_ATTEMPTS: u32 = 100;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Chunk coordinator shared by every backend of a deployment.
#[derive(Clone)]
pub struct ChunkUtils {
    chunk_size: u64,
    waiter: Arc<dyn ChunkWaiter>,
    notifier: Arc<dyn ChunkNotifier>,
    poll_timeout: Duration,
    max_attempts: u32,
}

impl ChunkUtils {
    pub fn new(
        chunk_size: u64,
        waiter: Arc<dyn ChunkWaiter>,
        notifier: Arc<dyn ChunkNotifier>,
    ) -> Self {
        Self {
            chunk_size,
            waiter,
            notifier,
            poll_timeout: DEFAULT_CHUNK_POLL_TIMEOUT,
            max_attempts: DEFAULT_MAX_CHUNK_ATTEMPTS,
        }
    }

    /// Poll-only coordinator with a no-op notifier.
    pub fn polling(chunk_size: u64) -> Self {
        Self::new(chunk_size, Arc::new(PollingWaiter), Arc::new(NoopNotifier))
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Splits the resolver's output into chunks stored through `server`.
    ///
    /// An existing chunk set at the key is removed first. A failure leaves
    /// the chunks written so far and an incomplete `info.json`; callers clean
    /// up with `remove`.
    pub async fn write_chunked(
        &self,
        server: &dyn StorageServer,
        dir: &str,
        address: &str,
        size: u64,
        resolver: &mut dyn Resolver,
    ) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(StorageError::Config(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let chunk_dir = join_key(&[dir, address]);
        match server.check(dir, address).await? {
            Some(existing) if !existing.is_chunked() => {
                return Err(StorageError::InvalidRequest(format!(
                    "{} already holds a non-chunked object",
                    chunk_dir
                )));
            }
            Some(_) => server.remove(dir, address).await?,
            None => {}
        }

        let info = ChunksInfo::new(size, self.chunk_size);
        self.write_info(server, &chunk_dir, &info).await?;

        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let produce = async move {
            let mut writer = writer;
            resolver.resolve(&mut writer).await?;
            writer.shutdown().await?;
            Ok::<_, StorageError>(())
        };
        let consume = self.write_chunks(server, &chunk_dir, size, info.num_chunks, reader);
        tokio::try_join!(produce, consume)?;

        let info = ChunksInfo {
            complete: true,
            mod_time: Utc::now(),
            ..info
        };
        self.write_info(server, &chunk_dir, &info).await?;

        tracing::debug!(
            "Stored chunked object {} ({} bytes in {} chunks)",
            chunk_dir,
            size,
            info.num_chunks
        );
        Ok(())
    }

    async fn write_chunks(
        &self,
        server: &dyn StorageServer,
        chunk_dir: &str,
        size: u64,
        num_chunks: u64,
        mut reader: DuplexStream,
    ) -> Result<()> {
        let mut written = 0u64;
        for chunk in 1..=num_chunks {
            let expected = self.chunk_size.min(size - written);
            let mut part = ChunkResolver {
                reader: (&mut reader).take(expected),
                copied: 0,
            };
            server.put(&mut part, chunk_dir, &chunk_name(chunk)).await?;
            if part.copied != expected {
                return Err(StorageError::InvalidRequest(format!(
                    "content for {} ended after {} of {} bytes",
                    chunk_dir,
                    written + part.copied,
                    size
                )));
            }
            written += expected;
            self.notify_chunk(server, chunk_dir, chunk).await;
        }

        let mut extra = [0u8; 1];
        if reader.read(&mut extra).await? != 0 {
            return Err(StorageError::InvalidRequest(format!(
                "content for {} is longer than the declared {} bytes",
                chunk_dir, size
            )));
        }
        Ok(())
    }

    async fn notify_chunk(&self, server: &dyn StorageServer, chunk_dir: &str, chunk: u64) {
        let notification = ChunkNotification {
            key: notification_key(server, chunk_dir),
            chunk,
            timeout: self.poll_timeout,
        };
        if let Err(err) = self.notifier.notify(&notification).await {
            tracing::warn!(
                "Error notifying chunk completion for {} (chunk {}): {}",
                chunk_dir,
                chunk,
                err
            );
        }
    }

    /// Opens a chunked object for sequential reading.
    ///
    /// Only `info.json` has to exist. Chunks are opened lazily; a missing
    /// chunk is waited for until the attempt budget runs out, at which point
    /// the stream fails with `StorageError::NoChunk`.
    pub async fn read_chunked(
        &self,
        server: Arc<dyn StorageServer>,
        dir: &str,
        address: &str,
    ) -> Result<FoundObject> {
        let chunk_dir = join_key(&[dir, address]);
        let info = self
            .read_info(server.as_ref(), &chunk_dir)
            .await?
            .ok_or_else(|| StorageError::NoChunkMetadata(chunk_dir.clone()))?;

        let stream = chunk_stream(self.clone(), server, chunk_dir, info.clone());
        Ok(FoundObject {
            reader: Box::pin(StreamReader::new(stream)),
            info: ObjectInfo::from_chunks(info),
        })
    }

    /// Loads `info.json` from a chunk directory.
    pub async fn read_info(
        &self,
        server: &dyn StorageServer,
        chunk_dir: &str,
    ) -> Result<Option<ChunksInfo>> {
        let Some(found) = server.get(chunk_dir, CHUNK_INFO_NAME).await? else {
            return Ok(None);
        };
        let mut reader = found.reader;
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    pub(crate) async fn write_info(
        &self,
        server: &dyn StorageServer,
        chunk_dir: &str,
        info: &ChunksInfo,
    ) -> Result<()> {
        let body = serde_json::to_vec(info)?;
        let mut resolver = BytesResolver::new(body);
        server.put(&mut resolver, chunk_dir, CHUNK_INFO_NAME).await?;
        Ok(())
    }

    async fn open_chunk(
        &self,
        server: &dyn StorageServer,
        chunk_dir: &str,
        chunk: u64,
        complete: bool,
    ) -> Result<ObjectReader> {
        let name = chunk_name(chunk);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(found) = server.get(chunk_dir, &name).await? {
                return Ok(found.reader);
            }

            if complete || attempts > self.max_attempts {
                return Err(StorageError::NoChunk {
                    key: chunk_dir.to_string(),
                    chunk,
                });
            }

            tracing::debug!(
                "Waiting for chunk {} of {} (attempt {})",
                chunk,
                chunk_dir,
                attempts
            );
            self.waiter
                .wait_for_chunk(&ChunkNotification {
                    key: notification_key(server, chunk_dir),
                    chunk,
                    timeout: self.poll_timeout,
                })
                .await;
        }
    }
}

/// Scopes a chunk directory to its backend so one broadcaster can serve
/// several storage classes.
fn notification_key(server: &dyn StorageServer, chunk_dir: &str) -> String {
    format!("{}#{}", server.dir(), chunk_dir)
}

fn chunk_stream(
    chunker: ChunkUtils,
    server: Arc<dyn StorageServer>,
    chunk_dir: String,
    info: ChunksInfo,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    async_stream::try_stream! {
        for chunk in 1..=info.num_chunks {
            let reader = chunker
                .open_chunk(server.as_ref(), &chunk_dir, chunk, info.complete)
                .await
                .map_err(std::io::Error::from)?;
            let mut frames = ReaderStream::new(reader);
            while let Some(frame) = frames.next().await {
                yield frame?;
            }
        }
    }
}

/// Copies exactly one chunk's worth of bytes out of the pipe.
struct ChunkResolver<'a> {
    reader: Take<&'a mut DuplexStream>,
    copied: u64,
}

#[async_trait]
impl Resolver for ChunkResolver<'_> {
    async fn resolve(
        &mut self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Option<ObjectKey>> {
        self.copied = tokio::io::copy(&mut self.reader, writer).await?;
        Ok(None)
    }
}

/// Collapses raw enumeration results: each `<dir>/info.json` becomes one
/// chunked item and everything else inside a chunk directory is dropped.
pub fn filter_chunks(items: Vec<StoredItem>) -> Vec<StoredItem> {
    let mut chunk_dirs = HashSet::new();
    let mut output = Vec::new();

    for item in &items {
        if !item.dir.is_empty() && item.address == CHUNK_INFO_NAME {
            chunk_dirs.insert(item.dir.clone());
            let (dir, address) = split_key(&item.dir);
            output.push(StoredItem {
                dir,
                address,
                chunked: true,
            });
        }
    }

    output.extend(
        items
            .into_iter()
            .filter(|item| !chunk_dirs.contains(&item.dir)),
    );
    output
}
