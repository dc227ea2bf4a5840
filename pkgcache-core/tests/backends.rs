use object_store::ObjectStore;
use object_store::memory::InMemory;
use pkgcache_core::{
    BytesResolver, ChunkUtils, ConnectionPool, ContentAddressedResolver, DatabaseStorage,
    FileStorage, FileStorageArgs, MetadataStorage, ReaderResolver, S3Storage, SqliteCacheStore,
    StorageError, StorageServer, StoredItem, compute_hash,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const CHUNK_SIZE: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    File,
    S3,
    Database,
}

const KINDS: [Kind; 3] = [Kind::File, Kind::S3, Kind::Database];

struct Backend {
    storage: Arc<dyn StorageServer>,
    _dir: Option<TempDir>,
}

fn chunker() -> ChunkUtils {
    ChunkUtils::polling(CHUNK_SIZE).with_poll_timeout(Duration::from_millis(10))
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn backend(kind: Kind) -> Backend {
    match kind {
        Kind::File => {
            let dir = tempfile::tempdir().unwrap();
            let storage = FileStorage::new(FileStorageArgs::new(dir.path(), chunker())).unwrap();
            Backend {
                storage: Arc::new(storage),
                _dir: Some(dir),
            }
        }
        Kind::S3 => {
            let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
            let bucket = format!("bucket-{}", ulid::Ulid::new().to_string().to_lowercase());
            Backend {
                storage: Arc::new(S3Storage::with_store(store, bucket, "cache", chunker())),
                _dir: None,
            }
        }
        Kind::Database => {
            let dir = tempfile::tempdir().unwrap();
            let pool = ConnectionPool::open(dir.path().join("objects.db"), 4).unwrap();
            let storage = DatabaseStorage::new(pool, "binaries", chunker()).await.unwrap();
            Backend {
                storage: Arc::new(storage),
                _dir: Some(dir),
            }
        }
    }
}

/// Two backends of the same technology that can reach each other natively.
async fn sibling_pair(kind: Kind) -> (Backend, Backend) {
    match kind {
        Kind::File => (backend(Kind::File).await, backend(Kind::File).await),
        Kind::S3 => {
            let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
            let source = S3Storage::with_store(Arc::clone(&store), "packages", "incoming", chunker());
            let dest = S3Storage::with_store(store, "packages", "binaries", chunker());
            (
                Backend {
                    storage: Arc::new(source),
                    _dir: None,
                },
                Backend {
                    storage: Arc::new(dest),
                    _dir: None,
                },
            )
        }
        Kind::Database => {
            let dir = tempfile::tempdir().unwrap();
            let pool = ConnectionPool::open(dir.path().join("objects.db"), 4).unwrap();
            let source = DatabaseStorage::new(Arc::clone(&pool), "incoming", chunker())
                .await
                .unwrap();
            let dest = DatabaseStorage::new(pool, "binaries", chunker()).await.unwrap();
            (
                Backend {
                    storage: Arc::new(source),
                    _dir: Some(dir),
                },
                Backend {
                    storage: Arc::new(dest),
                    _dir: None,
                },
            )
        }
    }
}

async fn read_all(storage: &dyn StorageServer, dir: &str, address: &str) -> Vec<u8> {
    let found = storage.get(dir, address).await.unwrap().unwrap();
    let mut reader = found.reader;
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

async fn put_plain(storage: &dyn StorageServer, dir: &str, address: &str, data: &[u8]) {
    let mut resolver = BytesResolver::new(data.to_vec());
    storage.put(&mut resolver, dir, address).await.unwrap();
}

async fn put_chunked(storage: &dyn StorageServer, dir: &str, address: &str, data: &[u8]) {
    let mut resolver = BytesResolver::new(data.to_vec());
    storage
        .put_chunked(&mut resolver, dir, address, data.len() as u64)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_round_trip_preserves_content() {
    let data = sample(10 * CHUNK_SIZE as usize - 7);

    for kind in KINDS {
        let backend = backend(kind).await;
        let storage = backend.storage.as_ref();

        put_plain(storage, "ab", "plain", &data).await;
        put_chunked(storage, "ab", "chunked", &data).await;

        assert_eq!(
            compute_hash(&read_all(storage, "ab", "plain").await),
            compute_hash(&data),
            "{:?}",
            kind
        );
        assert_eq!(
            compute_hash(&read_all(storage, "ab", "chunked").await),
            compute_hash(&data),
            "{:?}",
            kind
        );

        let plain = storage.check("ab", "plain").await.unwrap().unwrap();
        assert!(!plain.is_chunked(), "{:?}", kind);
        assert_eq!(plain.size, data.len() as u64, "{:?}", kind);

        let info = storage
            .check("ab", "chunked")
            .await
            .unwrap()
            .unwrap()
            .chunked
            .unwrap();
        assert_eq!(info.num_chunks, 10, "{:?}", kind);
        assert_eq!(info.file_size, data.len() as u64, "{:?}", kind);
        assert!(info.complete, "{:?}", kind);
    }
}

#[tokio::test]
async fn test_read_while_chunked_write_in_progress() {
    let data = sample(8 * CHUNK_SIZE as usize);

    for kind in KINDS {
        let backend = backend(kind).await;
        let storage = Arc::clone(&backend.storage);

        let (mut feed, source) = tokio::io::duplex(4096);
        let size = data.len() as u64;
        let writer = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                let mut resolver = ReaderResolver::new(source);
                storage.put_chunked(&mut resolver, "d", "live", size).await
            })
        };

        while storage.check("d", "live").await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let found = storage.get("d", "live").await.unwrap().unwrap();
        assert!(!found.info.chunked.as_ref().unwrap().complete, "{:?}", kind);

        let feeder = {
            let data = data.clone();
            tokio::spawn(async move {
                for piece in data.chunks(512) {
                    feed.write_all(piece).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                feed.shutdown().await.unwrap();
            })
        };

        let mut reader = found.reader;
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();

        feeder.await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(compute_hash(&body), compute_hash(&data), "{:?}", kind);

        let info = storage.check("d", "live").await.unwrap().unwrap().chunked.unwrap();
        assert!(info.complete, "{:?}", kind);
    }
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    for kind in KINDS {
        let backend = backend(kind).await;
        let storage = backend.storage.as_ref();

        storage.remove("d", "never-written").await.unwrap();

        put_plain(storage, "d", "plain", b"plain").await;
        put_chunked(storage, "d", "chunked", &sample(3000)).await;
        for address in ["plain", "chunked"] {
            storage.remove("d", address).await.unwrap();
            storage.remove("d", address).await.unwrap();
            assert!(storage.check("d", address).await.unwrap().is_none(), "{:?}", kind);
            assert!(storage.get("d", address).await.unwrap().is_none(), "{:?}", kind);
        }
        assert!(storage.enumerate().await.unwrap().is_empty(), "{:?}", kind);
    }
}

#[tokio::test]
async fn test_enumerate_collapses_chunk_sets() {
    for kind in KINDS {
        let backend = backend(kind).await;
        let storage = backend.storage.as_ref();

        put_plain(storage, "a", "y", b"plain").await;
        put_chunked(storage, "a", "x", &sample(2500)).await;

        let mut items = storage.enumerate().await.unwrap();
        items.sort();
        assert_eq!(
            items,
            vec![
                StoredItem {
                    dir: "a".to_string(),
                    address: "x".to_string(),
                    chunked: true,
                },
                StoredItem {
                    dir: "a".to_string(),
                    address: "y".to_string(),
                    chunked: false,
                },
            ],
            "{:?}",
            kind
        );
    }
}

#[tokio::test]
async fn test_move_and_copy_across_backends() {
    let data = sample(3 * CHUNK_SIZE as usize + 5);

    for source_kind in KINDS {
        for dest_kind in KINDS {
            let (source, dest) = if source_kind == dest_kind {
                sibling_pair(source_kind).await
            } else {
                (backend(source_kind).await, backend(dest_kind).await)
            };
            let source = source.storage.as_ref();
            let dest = dest.storage.as_ref();
            let label = format!("{:?} -> {:?}", source_kind, dest_kind);

            put_plain(source, "d", "plain", &data).await;
            put_chunked(source, "d", "chunked", &data).await;

            source.copy_to("d", "plain", dest).await.unwrap();
            assert!(source.check("d", "plain").await.unwrap().is_some(), "{}", label);
            assert_eq!(read_all(dest, "d", "plain").await, data, "{}", label);

            source.move_to("d", "chunked", dest).await.unwrap();
            assert!(source.check("d", "chunked").await.unwrap().is_none(), "{}", label);
            let info = dest.check("d", "chunked").await.unwrap().unwrap();
            assert!(info.chunked.unwrap().complete, "{}", label);
            assert_eq!(read_all(dest, "d", "chunked").await, data, "{}", label);

            let err = source.move_to("d", "missing", dest).await.unwrap_err();
            assert!(err.is_not_found(), "{}", label);
        }
    }
}

#[tokio::test]
async fn test_failed_native_move_falls_back_to_streaming() {
    let data = sample(2 * CHUNK_SIZE as usize + 100);

    for kind in [Kind::S3, Kind::Database] {
        let (source, dest) = sibling_pair(kind).await;
        let source = source.storage.as_ref();
        let dest = dest.storage.as_ref();

        put_chunked(source, "d", "a", &data).await;

        // Every chunk is present but the set claims to be unfinished, which
        // the server-side rung refuses.
        let mut info = source.check("d", "a").await.unwrap().unwrap().chunked.unwrap();
        info.complete = false;
        let mut resolver = BytesResolver::new(serde_json::to_vec(&info).unwrap());
        source.put(&mut resolver, "d/a", "info.json").await.unwrap();

        source.move_to("d", "a", dest).await.unwrap();

        assert!(source.check("d", "a").await.unwrap().is_none(), "{:?}", kind);
        let moved = dest.check("d", "a").await.unwrap().unwrap().chunked.unwrap();
        assert!(moved.complete, "{:?}", kind);
        assert_eq!(read_all(dest, "d", "a").await, data, "{:?}", kind);
    }
}

#[tokio::test]
async fn test_deferred_addressing() {
    let data = sample(4000);
    let digest = compute_hash(&data);

    for kind in KINDS {
        let backend = backend(kind).await;
        let storage = backend.storage.as_ref();

        let mut resolver = ContentAddressedResolver::new(&data[..]);
        let key = storage.put(&mut resolver, "", "").await.unwrap();
        assert_eq!(key.dir, &digest[..2], "{:?}", kind);
        assert_eq!(key.address, digest, "{:?}", kind);
        assert_eq!(read_all(storage, &key.dir, &key.address).await, data, "{:?}", kind);

        let mut unnamed = BytesResolver::new(&b"no key"[..]);
        let err = storage.put(&mut unnamed, "", "").await.unwrap_err();
        assert!(matches!(err.root(), StorageError::InvalidRequest(_)), "{:?}", kind);

        let mut resolver = BytesResolver::new(&b"abc"[..]);
        let err = storage
            .put_chunked(&mut resolver, "d", "", 3)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StorageError::InvalidRequest(_)), "{:?}", kind);

        let mut resolver = BytesResolver::new(Vec::new());
        let err = storage
            .put_chunked(&mut resolver, "d", "empty", 0)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StorageError::InvalidRequest(_)), "{:?}", kind);
    }
}

#[tokio::test]
async fn test_writes_never_mix_storage_shapes() {
    for kind in KINDS {
        let backend = backend(kind).await;
        let storage = backend.storage.as_ref();

        put_chunked(storage, "d", "chunked", &sample(2000)).await;
        let mut resolver = BytesResolver::new(&b"plain"[..]);
        let err = storage
            .put(&mut resolver, "d", "chunked")
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StorageError::InvalidRequest(_)), "{:?}", kind);

        put_plain(storage, "d", "plain", b"plain").await;
        let mut resolver = BytesResolver::new(sample(2000));
        let err = storage
            .put_chunked(&mut resolver, "d", "plain", 2000)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StorageError::InvalidRequest(_)), "{:?}", kind);

        assert_eq!(read_all(storage, "d", "plain").await, b"plain", "{:?}", kind);
    }
}

#[tokio::test]
async fn test_metadata_decorator_records_ladder_writes() {
    let data = sample(1500);

    for dest_kind in [Kind::S3, Kind::Database] {
        let source = backend(Kind::File).await;
        let dest = backend(dest_kind).await;
        let store = Arc::new(SqliteCacheStore::in_memory().unwrap());
        let decorated = MetadataStorage::new(Arc::clone(&dest.storage), store.clone(), "binaries");

        put_chunked(source.storage.as_ref(), "d", "a", &data).await;
        source.storage.move_to("d", "a", &decorated).await.unwrap();

        assert!(store.contains("binaries", "d/a").unwrap(), "{:?}", dest_kind);
        assert!(store.last_used("binaries", "d/a").unwrap().is_none(), "{:?}", dest_kind);

        assert_eq!(read_all(&decorated, "d", "a").await, data, "{:?}", dest_kind);
        assert!(store.last_used("binaries", "d/a").unwrap().is_some(), "{:?}", dest_kind);
        assert_eq!(decorated.storage_type(), dest.storage.storage_type());
    }
}
