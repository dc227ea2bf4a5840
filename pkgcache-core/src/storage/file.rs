use crate::chunks::{ChunkUtils, filter_chunks};
use crate::error::{Result, ResultExt, StorageError};
use crate::resolver::Resolver;
use crate::server::{
    StorageServer, chunk_set_conflict, ensure_chunked_put, resolve_final_key,
};
use crate::transfer;
use crate::types::{
    CHUNK_INFO_NAME, FoundObject, ObjectInfo, ObjectKey, STAGING_DIR, StorageType, StoredItem,
    Usage, is_chunk_name, join_key,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;
use walkdir::WalkDir;

pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_WALK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct FileStorageArgs {
    pub root: PathBuf,
    pub chunker: ChunkUtils,
    /// Upper bound for a whole usage walk.
    pub cache_timeout: Duration,
    /// Upper bound for the gap between two entries of a usage walk.
    pub walk_timeout: Duration,
}

impl FileStorageArgs {
    pub fn new(root: impl Into<PathBuf>, chunker: ChunkUtils) -> Self {
        Self {
            root: root.into(),
            chunker,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
            walk_timeout: DEFAULT_WALK_TIMEOUT,
        }
    }
}

/// Stores objects as files below a root directory. Chunked objects are
/// directories holding `info.json` and the chunk files.
#[derive(Clone)]
pub struct FileStorage {
    root: PathBuf,
    chunker: ChunkUtils,
    cache_timeout: Duration,
    walk_timeout: Duration,
}

impl FileStorage {
    pub fn new(args: FileStorageArgs) -> Result<Self> {
        std::fs::create_dir_all(&args.root)
            .with_context(|| format!("creating storage root {}", args.root.display()))?;
        Ok(Self {
            root: args.root,
            chunker: args.chunker,
            cache_timeout: args.cache_timeout,
            walk_timeout: args.walk_timeout,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, dir: &str, address: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in [dir, address] {
            if !part.is_empty() {
                path.push(part);
            }
        }
        path
    }

    async fn stat(&self, path: &Path) -> Result<Option<std::fs::Metadata>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
        }
    }

    async fn stage(&self, resolver: &mut dyn Resolver, staging: &Path) -> Result<Option<ObjectKey>> {
        let mut file = fs::File::create(staging).await?;
        let resolved = resolver.resolve(&mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(resolved)
    }

    async fn put_staged(
        &self,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
        staging: &Path,
    ) -> Result<ObjectKey> {
        let resolved = self.stage(resolver, staging).await?;
        let key = resolve_final_key(dir, address, resolved)?;

        let target = self.path_for(&key.dir, &key.address);
        if self.stat(&target).await?.is_some_and(|meta| meta.is_dir()) {
            return Err(chunk_set_conflict(&key.dir, &key.address));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staging, &target).await?;

        tracing::debug!("Stored object {} at {}", key, target.display());
        Ok(key)
    }

    /// Atomic rename into another file backend. Chunk sets still being
    /// written are refused.
    async fn rename_to(&self, dir: &str, address: &str, target: &FileStorage) -> Result<()> {
        let from = self.path_for(dir, address);
        let to = target.path_for(dir, address);
        if from == to {
            return Ok(());
        }
        if self.stat(&from).await?.is_some_and(|meta| meta.is_dir()) {
            let chunk_dir = join_key(&[dir, address]);
            let complete = self
                .chunker
                .read_info(self, &chunk_dir)
                .await?
                .is_some_and(|info| info.complete);
            if !complete {
                return Err(StorageError::Incomplete(chunk_dir));
            }
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from, &to).await?;
        Ok(())
    }

    /// True for directories that only hold chunk data.
    async fn is_chunk_dir(path: &Path) -> Result<bool> {
        let mut entries = fs::read_dir(path).await?;
        let mut empty = true;
        while let Some(entry) = entries.next_entry().await? {
            empty = false;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name == CHUNK_INFO_NAME || is_chunk_name(&name)) {
                return Ok(false);
            }
        }
        Ok(!empty)
    }
}

#[async_trait]
impl StorageServer for FileStorage {
    async fn check(&self, dir: &str, address: &str) -> Result<Option<ObjectInfo>> {
        let path = self.path_for(dir, address);
        let Some(meta) = self.stat(&path).await? else {
            return Ok(None);
        };

        if meta.is_dir() {
            let info = self
                .chunker
                .read_info(self, &join_key(&[dir, address]))
                .await
                .with_context(|| format!("reading chunk info for {}", path.display()))?;
            return Ok(info.map(ObjectInfo::from_chunks));
        }

        let mod_time = meta.modified().ok().map(DateTime::<Utc>::from);
        Ok(Some(ObjectInfo::plain(meta.len(), mod_time)))
    }

    async fn get(&self, dir: &str, address: &str) -> Result<Option<FoundObject>> {
        let path = self.path_for(dir, address);
        let Some(meta) = self.stat(&path).await? else {
            return Ok(None);
        };

        if meta.is_dir() {
            return match self
                .chunker
                .read_chunked(Arc::new(self.clone()), dir, address)
                .await
            {
                Ok(found) => Ok(Some(found)),
                Err(StorageError::NoChunkMetadata(_)) => Ok(None),
                Err(err) => Err(err),
            };
        }

        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("opening {}", path.display()));
            }
        };
        let mod_time = meta.modified().ok().map(DateTime::<Utc>::from);
        Ok(Some(FoundObject {
            reader: Box::pin(file),
            info: ObjectInfo::plain(meta.len(), mod_time),
        }))
    }

    async fn put(
        &self,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
    ) -> Result<ObjectKey> {
        let staging_dir = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging_dir).await?;
        let staging = staging_dir.join(Ulid::new().to_string());

        let result = self.put_staged(resolver, dir, address, &staging).await;
        if result.is_err() {
            if let Err(err) = fs::remove_file(&staging).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(
                        "Failed to clean up staging file {}: {}",
                        staging.display(),
                        err
                    );
                }
            }
        }
        result.with_context(|| format!("storing {}", join_key(&[dir, address])))
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
        let path = self.path_for(dir, address);
        let Some(meta) = self.stat(&path).await? else {
            return Ok(());
        };

        let result = if meta.is_dir() {
            if !Self::is_chunk_dir(&path).await? {
                return Ok(());
            }
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }

    async fn enumerate(&self) -> Result<Vec<StoredItem>> {
        let root = self.root.clone();
        let items = tokio::task::spawn_blocking(move || list_files(&root))
            .await
            .map_err(|e| StorageError::Internal(format!("enumerate task failed: {}", e)))??;
        Ok(filter_chunks(items))
    }

    async fn move_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()> {
        let native = dest
            .base()
            .as_any()
            .downcast_ref::<FileStorage>()
            .map(|target| self.rename_to(dir, address, target));
        transfer::with_fallback(
            "move",
            &join_key(&[dir, address]),
            native,
            transfer::move_streaming(self, dir, address, dest),
        )
        .await
    }

    async fn copy_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()> {
        let same_root = dest
            .base()
            .as_any()
            .downcast_ref::<FileStorage>()
            .is_some_and(|target| target.root == self.root);
        if same_root {
            return Ok(());
        }
        transfer::copy_streaming(self, dir, address, dest).await
    }

    async fn flush(&self, dir: &str, address: &str) -> Result<()> {
        // Stat the parent and the entry so network filesystems drop stale
        // attribute caches.
        let path = self.path_for(dir, address);
        if let Some(parent) = path.parent() {
            self.stat(parent).await?;
        }
        self.stat(&path).await?;
        Ok(())
    }

    fn locate(&self, dir: &str, address: &str) -> String {
        self.path_for(dir, address).to_string_lossy().into_owned()
    }

    fn dir(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }

    async fn calculate_usage(&self) -> Result<Usage> {
        let started = Instant::now();
        let (size_bytes, free_bytes) = filesystem_stats(&self.root)?;

        let root = self.root.clone();
        let walk_timeout = self.walk_timeout;
        let cache_timeout = self.cache_timeout;
        let walk = tokio::task::spawn_blocking(move || used_bytes(&root, cache_timeout, walk_timeout));
        let used_bytes = match tokio::time::timeout(self.cache_timeout, walk).await {
            Ok(joined) => joined
                .map_err(|e| StorageError::Internal(format!("usage walk failed: {}", e)))??,
            Err(_) => {
                return Err(StorageError::Timeout(format!(
                    "usage calculation for {} exceeded {:?}",
                    self.root.display(),
                    self.cache_timeout
                )));
            }
        };

        Ok(Usage {
            size_bytes,
            free_bytes,
            used_bytes,
            calculation_time: started.elapsed(),
        })
    }

    fn base(&self) -> &dyn StorageServer {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn list_files(root: &Path) -> Result<Vec<StoredItem>> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == STAGING_DIR));

    let mut items = Vec::new();
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let dir = relative
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_default();
        items.push(StoredItem {
            dir,
            address: entry.file_name().to_string_lossy().into_owned(),
            chunked: false,
        });
    }
    Ok(items)
}

fn used_bytes(root: &Path, cache_timeout: Duration, walk_timeout: Duration) -> Result<u64> {
    let started = Instant::now();
    let mut last_entry = started;
    let mut total = 0u64;

    for entry in WalkDir::new(root) {
        let now = Instant::now();
        if now.duration_since(started) > cache_timeout
            || now.duration_since(last_entry) > walk_timeout
        {
            return Err(StorageError::Timeout(format!(
                "walking {} took too long",
                root.display()
            )));
        }
        last_entry = now;

        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(std::io::Error::from)?.len();
        }
    }
    Ok(total)
}

/// Total and available bytes of the filesystem holding `path`.
fn filesystem_stats(path: &Path) -> Result<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| StorageError::InvalidRequest(format!("invalid storage root: {}", e)))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs {}", path.display()));
    }

    let block_size = stat.f_frsize as u64;
    Ok((
        stat.f_blocks as u64 * block_size,
        stat.f_bavail as u64 * block_size,
    ))
}
