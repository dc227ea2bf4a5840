//! Content producers handed to `put` and `put_chunked`.
//!
//! A resolver is called exactly once per write. It owns the writer only for
//! the duration of the call and may return a computed key, which backends use
//! when the caller left the key empty.

use crate::error::Result;
use crate::types::ObjectKey;
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[async_trait]
pub trait Resolver: Send {
    async fn resolve(
        &mut self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Option<ObjectKey>>;
}

/// Writes an in-memory buffer.
#[derive(Debug, Clone)]
pub struct BytesResolver {
    data: Bytes,
    key: Option<ObjectKey>,
}

impl BytesResolver {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            key: None,
        }
    }

    /// Reports `key` as the computed key once the data is written.
    pub fn with_key(mut self, key: ObjectKey) -> Self {
        self.key = Some(key);
        self
    }
}

#[async_trait]
impl Resolver for BytesResolver {
    async fn resolve(
        &mut self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Option<ObjectKey>> {
        writer.write_all(&self.data).await?;
        Ok(self.key.clone())
    }
}

/// Copies everything from a reader.
pub struct ReaderResolver<R> {
    reader: R,
    copied: u64,
}

impl<R> ReaderResolver<R>
where
    R: AsyncRead + Send + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self { reader, copied: 0 }
    }

    pub fn copied(&self) -> u64 {
        self.copied
    }
}

#[async_trait]
impl<R> Resolver for ReaderResolver<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn resolve(
        &mut self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Option<ObjectKey>> {
        self.copied = tokio::io::copy(&mut self.reader, writer).await?;
        Ok(None)
    }
}

/// Copies a reader and names the object after the SHA256 of its content:
/// `dir` is the first two hex digits and `address` the full digest.
pub struct ContentAddressedResolver<R> {
    reader: R,
    digest: Option<String>,
}

impl<R> ContentAddressedResolver<R>
where
    R: AsyncRead + Send + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            digest: None,
        }
    }

    /// Hex digest of the content, available after `resolve` ran.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

#[async_trait]
impl<R> Resolver for ContentAddressedResolver<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn resolve(
        &mut self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Option<ObjectKey>> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = self.reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            writer.write_all(&buf[..read]).await?;
        }

        let digest = hex::encode(hasher.finalize());
        let key = ObjectKey::new(&digest[..2], digest.clone());
        self.digest = Some(digest);
        Ok(Some(key))
    }
}
