use crate::chunks::{ChunkUtils, filter_chunks};
use crate::error::{Result, ResultExt, StorageError};
use crate::resolver::Resolver;
use crate::server::{
    StorageServer, chunk_set_conflict, ensure_chunked_put, resolve_final_key,
};
use crate::transfer;
use crate::types::{
    CHUNK_INFO_NAME, FoundObject, ObjectInfo, ObjectKey, STAGING_DIR, StorageType, StoredItem,
    Usage, chunk_name, is_chunk_name, join_key, split_key,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::any::Any;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use ulid::Ulid;

#[derive(Clone, Default)]
pub struct S3StorageArgs {
    pub bucket: String,
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub allow_http: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Stores objects in an S3-compatible bucket under an optional prefix.
#[derive(Clone)]
pub struct S3Storage {
    store: Arc<dyn ObjectStore>,
    /// Endpoint and region of clients built from settings. Two storages
    /// with equal services reach the same buckets.
    service: Option<String>,
    bucket: String,
    prefix: String,
    chunker: ChunkUtils,
}

impl S3Storage {
    pub fn new(args: S3StorageArgs, chunker: ChunkUtils) -> Result<Self> {
        if args.bucket.trim().is_empty() {
            return Err(StorageError::Config(
                "s3 bucket cannot be empty".to_string(),
            ));
        }

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&args.bucket);
        if let Some(region) = &args.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &args.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        builder = builder.with_allow_http(args.allow_http);
        if let (Some(key_id), Some(secret)) = (&args.access_key_id, &args.secret_access_key) {
            builder = builder
                .with_access_key_id(key_id)
                .with_secret_access_key(secret);
        }

        let store = builder
            .build()
            .with_context(|| format!("creating s3 client for bucket {}", args.bucket))?;
        let service = format!(
            "{}#{}",
            args.endpoint.as_deref().unwrap_or_default(),
            args.region.as_deref().unwrap_or_default()
        );
        let mut storage = Self::with_store(Arc::new(store), args.bucket, args.prefix, chunker);
        storage.service = Some(service);
        Ok(storage)
    }

    /// Uses an already constructed object store client.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        chunker: ChunkUtils,
    ) -> Self {
        Self {
            store,
            service: None,
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            chunker,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_path(&self, dir: &str, address: &str) -> Path {
        Path::from(join_key(&[&self.prefix, dir, address]))
    }

    fn staging_path(&self, name: &str) -> Path {
        Path::from(join_key(&[&self.prefix, STAGING_DIR, name]))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.store.head(path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err).with_context(|| format!("head {}", path)),
        }
    }

    async fn is_chunk_set(&self, dir: &str, address: &str) -> Result<bool> {
        self.exists(&self.object_path(&join_key(&[dir, address]), CHUNK_INFO_NAME))
            .await
    }

    async fn upload(
        &self,
        resolver: &mut dyn Resolver,
        path: &Path,
    ) -> Result<Option<ObjectKey>> {
        let mut writer = BufWriter::new(Arc::clone(&self.store), path.clone());
        let resolved = match resolver.resolve(&mut writer).await {
            Ok(resolved) => resolved,
            Err(err) => {
                if let Err(abort_err) = writer.abort().await {
                    tracing::debug!("Failed to abort upload to {}: {}", path, abort_err);
                }
                return Err(err);
            }
        };
        writer.shutdown().await?;
        Ok(resolved)
    }

    /// Source and destination locations of every physical object behind
    /// `dir/address`. For chunk sets `info.json` comes last.
    async fn parts(
        &self,
        dir: &str,
        address: &str,
        target: &S3Storage,
    ) -> Result<Vec<(Path, Path)>> {
        let path = self.object_path(dir, address);
        if self.exists(&path).await? {
            return Ok(vec![(path, target.object_path(dir, address))]);
        }

        let chunk_dir = join_key(&[dir, address]);
        let info = self
            .chunker
            .read_info(self, &chunk_dir)
            .await?
            .ok_or_else(|| StorageError::NotFound(chunk_dir.clone()))?;
        if !info.complete {
            return Err(StorageError::Incomplete(chunk_dir));
        }

        let mut parts: Vec<(Path, Path)> = (1..=info.num_chunks)
            .map(|chunk| {
                let name = chunk_name(chunk);
                (
                    self.object_path(&chunk_dir, &name),
                    target.object_path(&chunk_dir, &name),
                )
            })
            .collect();
        parts.push((
            self.object_path(&chunk_dir, CHUNK_INFO_NAME),
            target.object_path(&chunk_dir, CHUNK_INFO_NAME),
        ));
        Ok(parts)
    }

    /// True when a server-side copy through our client lands where `target`
    /// reads: same bucket, reached through the same client or service.
    fn shares_bucket(&self, target: &S3Storage) -> bool {
        let same_service = Arc::ptr_eq(&self.store, &target.store)
            || (self.service.is_some() && self.service == target.service);
        same_service && self.bucket == target.bucket
    }

    fn same_location(&self, target: &S3Storage) -> bool {
        self.bucket == target.bucket && self.prefix == target.prefix
    }

    /// Server-side copy into another prefix of the same bucket.
    async fn copy_native(&self, dir: &str, address: &str, target: &S3Storage) -> Result<()> {
        if self.same_location(target) {
            return Ok(());
        }
        let parts = self.parts(dir, address, target).await?;
        target.remove(dir, address).await?;
        for (from, to) in parts {
            self.store
                .copy(&from, &to)
                .await
                .with_context(|| format!("copying {} to {}", from, to))?;
        }
        Ok(())
    }

    async fn move_native(&self, dir: &str, address: &str, target: &S3Storage) -> Result<()> {
        if self.same_location(target) {
            return Ok(());
        }
        self.copy_native(dir, address, target).await?;
        self.remove(dir, address).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        match self.store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("deleting {}", path)),
        }
    }

    /// Confirms the bucket accepts writes, reads and deletes.
    pub async fn validate(&self) -> Result<()> {
        let path = self.staging_path(&format!("validate.{}.txt", Ulid::new()));
        let payload = PutPayload::from(Bytes::from_static(b"validate"));
        self.store
            .put(&path, payload)
            .await
            .with_context(|| format!("validating write access to {}", self.locate_path(&path)))?;
        self.store
            .head(&path)
            .await
            .with_context(|| format!("validating read access to {}", self.locate_path(&path)))?;
        self.store
            .delete(&path)
            .await
            .with_context(|| format!("validating delete access to {}", self.locate_path(&path)))?;
        Ok(())
    }

    fn locate_path(&self, path: &Path) -> String {
        format!("s3://{}/{}", self.bucket, path)
    }
}

#[async_trait]
impl StorageServer for S3Storage {
    async fn check(&self, dir: &str, address: &str) -> Result<Option<ObjectInfo>> {
        let path = self.object_path(dir, address);
        match self.store.head(&path).await {
            Ok(meta) => Ok(Some(ObjectInfo::plain(
                meta.size as u64,
                Some(meta.last_modified),
            ))),
            Err(object_store::Error::NotFound { .. }) => {
                let info = self
                    .chunker
                    .read_info(self, &join_key(&[dir, address]))
                    .await
                    .with_context(|| format!("reading chunk info for {}", path))?;
                Ok(info.map(ObjectInfo::from_chunks))
            }
            Err(err) => Err(err).with_context(|| format!("head {}", path)),
        }
    }

    async fn get(&self, dir: &str, address: &str) -> Result<Option<FoundObject>> {
        let path = self.object_path(dir, address);
        match self.store.get(&path).await {
            Ok(result) => {
                let info = ObjectInfo::plain(
                    result.meta.size as u64,
                    Some(result.meta.last_modified),
                );
                let stream = result.into_stream().map_err(std::io::Error::from);
                Ok(Some(FoundObject {
                    reader: Box::pin(StreamReader::new(stream)),
                    info,
                }))
            }
            Err(object_store::Error::NotFound { .. }) => {
                if !self.is_chunk_set(dir, address).await? {
                    return Ok(None);
                }
                match self
                    .chunker
                    .read_chunked(Arc::new(self.clone()), dir, address)
                    .await
                {
                    Ok(found) => Ok(Some(found)),
                    Err(StorageError::NoChunkMetadata(_)) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err).with_context(|| format!("get {}", path)),
        }
    }

    async fn put(
        &self,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
    ) -> Result<ObjectKey> {
        if !dir.is_empty() || !address.is_empty() {
            if self.is_chunk_set(dir, address).await? {
                return Err(chunk_set_conflict(dir, address));
            }
            let path = self.object_path(dir, address);
            self.upload(resolver, &path)
                .await
                .with_context(|| format!("uploading {}", path))?;
            return Ok(ObjectKey::new(dir, address));
        }

        let staging = self.staging_path(&Ulid::new().to_string());
        let resolved = self
            .upload(resolver, &staging)
            .await
            .with_context(|| format!("uploading {}", staging))?;

        let placed = async {
            let key = resolve_final_key(dir, address, resolved)?;
            if self.is_chunk_set(&key.dir, &key.address).await? {
                return Err(chunk_set_conflict(&key.dir, &key.address));
            }
            let target = self.object_path(&key.dir, &key.address);
            self.store
                .rename(&staging, &target)
                .await
                .with_context(|| format!("moving {} to {}", staging, target))?;
            Ok(key)
        }
        .await;

        if placed.is_err() {
            if let Err(err) = self.delete(&staging).await {
                tracing::debug!("Failed to clean up staging object {}: {}", staging, err);
            }
        }
        placed
    }

    async fn put_chunked(
        &self,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
        size: u64,
    ) -> Result<ObjectKey> {
        ensure_chunked_put(address, size)?;
        self.chunker
            .write_chunked(self, dir, address, size, resolver)
            .await?;
        Ok(ObjectKey::new(dir, address))
    }

    async fn remove(&self, dir: &str, address: &str) -> Result<()> {
        let path = self.object_path(dir, address);
        if self.exists(&path).await? {
            return self.delete(&path).await;
        }

        let chunk_dir = self.object_path(&join_key(&[dir, address]), "");
        let listing = self
            .store
            .list_with_delimiter(Some(&chunk_dir))
            .await
            .with_context(|| format!("listing {}", chunk_dir))?;

        let mut info = None;
        let mut chunks = Vec::new();
        for meta in listing.objects {
            let is_info = meta.location.filename() == Some(CHUNK_INFO_NAME);
            let is_chunk = meta.location.filename().is_some_and(is_chunk_name);
            if is_info {
                info = Some(meta.location);
            } else if is_chunk {
                chunks.push(meta.location);
            }
        }
        if info.is_none() && chunks.is_empty() {
            return Ok(());
        }

        for chunk in &chunks {
            self.delete(chunk).await?;
        }
        if let Some(info) = info {
            self.delete(&info).await?;
        }
        Ok(())
    }

    async fn enumerate(&self) -> Result<Vec<StoredItem>> {
        let prefix = (!self.prefix.is_empty()).then(|| Path::from(self.prefix.as_str()));
        let mut listing = self.store.list(prefix.as_ref());
        let staging = format!("{}/", STAGING_DIR);

        let mut items = Vec::new();
        while let Some(meta) = listing.next().await {
            let meta = meta.with_context(|| format!("listing {}", self.dir()))?;
            let location = meta.location.as_ref();
            let relative = if self.prefix.is_empty() {
                location
            } else {
                location
                    .strip_prefix(self.prefix.as_str())
                    .map(|rest| rest.trim_start_matches('/'))
                    .unwrap_or(location)
            };
            if relative.starts_with(&staging) {
                continue;
            }
            let (dir, address) = split_key(relative);
            items.push(StoredItem {
                dir,
                address,
                chunked: false,
            });
        }
        Ok(filter_chunks(items))
    }

    async fn move_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()> {
        let native = dest
            .base()
            .as_any()
            .downcast_ref::<S3Storage>()
            .filter(|target| self.shares_bucket(target))
            .map(|target| self.move_native(dir, address, target));
        transfer::with_fallback(
            "move",
            &self.locate(dir, address),
            native,
            transfer::move_streaming(self, dir, address, dest),
        )
        .await
    }

    async fn copy_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()> {
        let native = dest
            .base()
            .as_any()
            .downcast_ref::<S3Storage>()
            .filter(|target| self.shares_bucket(target))
            .map(|target| self.copy_native(dir, address, target));
        transfer::with_fallback(
            "copy",
            &self.locate(dir, address),
            native,
            transfer::copy_streaming(self, dir, address, dest),
        )
        .await
    }

    fn locate(&self, dir: &str, address: &str) -> String {
        self.locate_path(&self.object_path(dir, address))
    }

    fn dir(&self) -> String {
        format!("s3:{}", self.bucket)
    }

    fn storage_type(&self) -> StorageType {
        StorageType::S3
    }

    async fn calculate_usage(&self) -> Result<Usage> {
        Err(StorageError::Unsupported {
            storage_type: StorageType::S3,
            operation: "usage calculation",
        })
    }

    fn base(&self) -> &dyn StorageServer {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::BytesResolver;
    use object_store::memory::InMemory;
    use tokio::io::AsyncReadExt;

    fn storage(store: Arc<dyn ObjectStore>, prefix: &str) -> S3Storage {
        S3Storage::with_store(store, "packages", prefix, ChunkUtils::polling(4))
    }

    async fn read_all(storage: &S3Storage, dir: &str, address: &str) -> Vec<u8> {
        let found = storage.get(dir, address).await.unwrap().unwrap();
        let mut reader = found.reader;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_put_get_under_prefix() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let storage = storage(Arc::clone(&store), "cache/binaries");

        let mut resolver = BytesResolver::new(&b"tarball"[..]);
        storage.put(&mut resolver, "d", "pkg.tar.gz").await.unwrap();

        let raw = store
            .get(&Path::from("cache/binaries/d/pkg.tar.gz"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(raw.as_ref(), b"tarball");
        assert_eq!(read_all(&storage, "d", "pkg.tar.gz").await, b"tarball");

        let info = storage.check("d", "pkg.tar.gz").await.unwrap().unwrap();
        assert_eq!(info.size, 7);
        assert!(storage.check("d", "missing").await.unwrap().is_none());
        assert!(storage.get("d", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deferred_put_leaves_no_staging_objects() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let storage = storage(Arc::clone(&store), "");

        let mut resolver =
            BytesResolver::new(&b"content"[..]).with_key(ObjectKey::new("ab", "abcdef"));
        let key = storage.put(&mut resolver, "", "").await.unwrap();
        assert_eq!(key, ObjectKey::new("ab", "abcdef"));

        let listed: Vec<_> = store.list(None).map(|meta| meta.unwrap().location).collect().await;
        assert_eq!(listed, vec![Path::from("ab/abcdef")]);
    }

    #[tokio::test]
    async fn test_remove_chunked_deletes_every_part() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let storage = storage(Arc::clone(&store), "p");

        let mut resolver = BytesResolver::new(&b"0123456789"[..]);
        storage.put_chunked(&mut resolver, "d", "a", 10).await.unwrap();
        let info = storage.check("d", "a").await.unwrap().unwrap();
        assert_eq!(info.chunked.unwrap().num_chunks, 3);

        storage.remove("d", "a").await.unwrap();
        assert!(storage.check("d", "a").await.unwrap().is_none());
        let remaining: Vec<_> = store.list(None).collect().await;
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_native_copy_within_bucket() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let source = storage(Arc::clone(&store), "src");
        let dest = storage(Arc::clone(&store), "dst");

        let mut resolver = BytesResolver::new(&b"0123456789"[..]);
        source.put_chunked(&mut resolver, "d", "a", 10).await.unwrap();

        source.copy_to("d", "a", &dest).await.unwrap();

        assert!(source.check("d", "a").await.unwrap().is_some());
        let info = dest.check("d", "a").await.unwrap().unwrap();
        assert!(info.chunked.unwrap().complete);
        assert_eq!(read_all(&dest, "d", "a").await, b"0123456789");
    }

    #[test]
    fn test_shares_bucket_by_service() {
        let args = |endpoint: &str| S3StorageArgs {
            bucket: "packages".to_string(),
            region: Some("us-east-1".to_string()),
            endpoint: Some(endpoint.to_string()),
            allow_http: true,
            ..Default::default()
        };
        let minio = S3Storage::new(args("http://minio:9000"), ChunkUtils::polling(4)).unwrap();
        let incoming = S3Storage::new(
            S3StorageArgs {
                prefix: "incoming".to_string(),
                ..args("http://minio:9000")
            },
            ChunkUtils::polling(4),
        )
        .unwrap();
        let other = S3Storage::new(args("http://other:9000"), ChunkUtils::polling(4)).unwrap();

        assert!(minio.shares_bucket(&incoming));
        assert!(!minio.shares_bucket(&other));
    }

    #[tokio::test]
    async fn test_move_between_clients_with_same_bucket_name_streams() {
        let source_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let dest_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let source = storage(Arc::clone(&source_store), "src");
        let dest = storage(Arc::clone(&dest_store), "dst");
        assert!(!source.shares_bucket(&dest));

        let mut resolver = BytesResolver::new(&b"tarball"[..]);
        source.put(&mut resolver, "d", "a").await.unwrap();
        let mut resolver = BytesResolver::new(&b"0123456789"[..]);
        source.put_chunked(&mut resolver, "d", "big", 10).await.unwrap();

        source.move_to("d", "a", &dest).await.unwrap();
        source.copy_to("d", "big", &dest).await.unwrap();

        assert!(source.check("d", "a").await.unwrap().is_none());
        assert_eq!(read_all(&dest, "d", "a").await, b"tarball");
        assert_eq!(read_all(&dest, "d", "big").await, b"0123456789");
        assert_eq!(read_all(&source, "d", "big").await, b"0123456789");

        let leaked: Vec<_> = source_store
            .list(Some(&Path::from("dst")))
            .collect()
            .await;
        assert!(leaked.is_empty());
    }

    #[tokio::test]
    async fn test_native_copy_refuses_incomplete_chunk_set() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let source = storage(Arc::clone(&store), "src");
        let dest = storage(Arc::clone(&store), "dst");

        let info = crate::types::ChunksInfo::new(10, 4);
        source.chunker.write_info(&source, "d/a", &info).await.unwrap();

        let err = source.copy_native("d", "a", &dest).await.unwrap_err();
        assert!(matches!(err, StorageError::Incomplete(_)));
    }

    #[tokio::test]
    async fn test_usage_is_unsupported() {
        let storage = storage(Arc::new(InMemory::new()), "");
        let err = storage.calculate_usage().await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Unsupported {
                storage_type: StorageType::S3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_validate_cleans_up() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let storage = storage(Arc::clone(&store), "p");

        storage.validate().await.unwrap();
        let remaining: Vec<_> = store.list(None).collect().await;
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_locate_and_dir() {
        let storage = storage(Arc::new(InMemory::new()), "/cache/");
        assert_eq!(storage.locate("d", "a"), "s3://packages/cache/d/a");
        assert_eq!(storage.dir(), "s3:packages");
    }
}
