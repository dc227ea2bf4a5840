use super::pool::{ConnectionPool, Transaction, TxMode};
use crate::chunks::{ChunkUtils, filter_chunks};
use crate::error::{Result, ResultExt, StorageError};
use crate::resolver::Resolver;
use crate::server::{
    StorageServer, chunk_set_conflict, ensure_chunked_put, resolve_final_key,
};
use crate::transfer;
use crate::types::{
    CHUNK_INFO_NAME, ChunksInfo, FoundObject, ObjectInfo, ObjectKey, STAGING_DIR, StorageType,
    StoredItem, Usage, chunk_name, is_chunk_name, join_key, split_key,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::any::Any;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use ulid::Ulid;

/// Size of one stored page of a large object.
pub const LARGE_OBJECT_PAGE_SIZE: usize = 64 * 1024;

/// Stores objects as large objects in a SQLite database.
///
/// `large_objects` maps a location (`class/dir/address`) to a large object
/// id; the bytes live in `large_object_pages`. Chunked objects are plain
/// mappings for `info.json` and each chunk.
#[derive(Clone)]
pub struct DatabaseStorage {
    pool: Arc<ConnectionPool>,
    class: String,
    chunker: ChunkUtils,
}

#[derive(Debug, Clone)]
struct MappedObject {
    oid: i64,
    size: u64,
    modified: DateTime<Utc>,
}

impl DatabaseStorage {
    pub async fn new(
        pool: Arc<ConnectionPool>,
        class: impl Into<String>,
        chunker: ChunkUtils,
    ) -> Result<Self> {
        let class = class.into().trim_matches('/').to_string();
        if class.is_empty() {
            return Err(StorageError::Config(
                "database storage class cannot be empty".to_string(),
            ));
        }

        let conn = pool.acquire().await?;
        init_schema(&conn).with_context(|| format!("initializing schema for {}", class))?;
        drop(conn);

        Ok(Self {
            pool,
            class,
            chunker,
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn location(&self, dir: &str, address: &str) -> String {
        join_key(&[&self.class, dir, address])
    }

    fn shares_database(&self, target: &DatabaseStorage) -> bool {
        Arc::ptr_eq(&self.pool, &target.pool) || self.pool.path() == target.pool.path()
    }

    async fn put_in(
        &self,
        tx: &mut Transaction,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
    ) -> Result<ObjectKey> {
        let oid = create_large_object(tx)?;
        let staging = self.location(STAGING_DIR, &Ulid::new().to_string());
        insert_mapping(tx, &staging, oid, 0)?;

        let mut writer = LargeObjectWriter::new(tx.connection(), oid);
        let resolved = resolver.resolve(&mut writer).await?;
        let size = writer.finish()?;

        let key = resolve_final_key(dir, address, resolved)?;
        let location = self.location(&key.dir, &key.address);
        if lookup(tx, &join_key(&[&location, CHUNK_INFO_NAME]))?.is_some() {
            return Err(chunk_set_conflict(&key.dir, &key.address));
        }
        remove_mapping(tx, &location)?;
        tx.execute(
            "UPDATE large_objects SET address = ?1, size = ?2, modified = ?3 WHERE address = ?4",
            params![location, size as i64, Utc::now().to_rfc3339(), staging],
        )?;

        tracing::debug!("Stored large object {} for {}", oid, location);
        Ok(key)
    }

    /// Source and destination locations behind `dir/address`; for chunk sets
    /// `info.json` comes last.
    fn parts(
        &self,
        conn: &Connection,
        dir: &str,
        address: &str,
        target: &DatabaseStorage,
    ) -> Result<Vec<(String, String)>> {
        let location = self.location(dir, address);
        if lookup(conn, &location)?.is_some() {
            return Ok(vec![(location, target.location(dir, address))]);
        }

        let chunk_dir = join_key(&[dir, address]);
        let info_location = join_key(&[&location, CHUNK_INFO_NAME]);
        let mapped = lookup(conn, &info_location)?
            .ok_or_else(|| StorageError::NotFound(chunk_dir.clone()))?;
        let info: ChunksInfo = serde_json::from_slice(&read_large_object(conn, mapped.oid)?)?;
        if !info.complete {
            return Err(StorageError::Incomplete(chunk_dir));
        }

        let mut parts: Vec<(String, String)> = (1..=info.num_chunks)
            .map(|chunk| {
                let name = chunk_name(chunk);
                (
                    self.location(&chunk_dir, &name),
                    target.location(&chunk_dir, &name),
                )
            })
            .collect();
        parts.push((info_location, target.location(&chunk_dir, CHUNK_INFO_NAME)));
        Ok(parts)
    }

    /// Re-points (move) or duplicates (copy) the mappings in one transaction.
    async fn transfer_native(
        &self,
        dir: &str,
        address: &str,
        target: &DatabaseStorage,
        keep_source: bool,
    ) -> Result<()> {
        if self.class == target.class {
            return Ok(());
        }

        let operation = if keep_source { "copy" } else { "move" };
        let tx = self
            .pool
            .begin(
                TxMode::Write,
                format!("{} {} to {}", operation, join_key(&[dir, address]), target.class),
            )
            .await?;
        let result = self.transfer_in(&tx, dir, address, target, keep_source);
        tx.finish(result)
    }

    fn transfer_in(
        &self,
        conn: &Connection,
        dir: &str,
        address: &str,
        target: &DatabaseStorage,
        keep_source: bool,
    ) -> Result<()> {
        let parts = self.parts(conn, dir, address, target)?;
        clear_object(conn, &target.location(dir, address))?;

        for (from, to) in parts {
            if keep_source {
                let source = lookup(conn, &from)?.ok_or_else(|| StorageError::NotFound(from.clone()))?;
                let oid = create_large_object(conn)?;
                conn.execute(
                    "INSERT INTO large_object_pages (oid, pageno, data)
                     SELECT ?1, pageno, data FROM large_object_pages WHERE oid = ?2",
                    params![oid, source.oid],
                )?;
                insert_mapping(conn, &to, oid, source.size)?;
            } else {
                conn.execute(
                    "UPDATE large_objects SET address = ?1 WHERE address = ?2",
                    params![to, from],
                )?;
            }
        }
        Ok(())
    }

    async fn remove_location(&self, location: &str) -> Result<bool> {
        let tx = self
            .pool
            .begin(TxMode::Write, format!("remove {}", location))
            .await?;
        let result = remove_mapping(&tx, location);
        tx.finish(result)
    }
}

#[async_trait]
impl StorageServer for DatabaseStorage {
    async fn check(&self, dir: &str, address: &str) -> Result<Option<ObjectInfo>> {
        let location = self.location(dir, address);
        let tx = self
            .pool
            .begin(TxMode::Read, format!("check {}", location))
            .await?;
        let result = lookup(&tx, &location);
        if let Some(mapped) = tx.finish(result)? {
            return Ok(Some(ObjectInfo::plain(mapped.size, Some(mapped.modified))));
        }

        let info = self
            .chunker
            .read_info(self, &join_key(&[dir, address]))
            .await
            .with_context(|| format!("reading chunk info for {}", location))?;
        Ok(info.map(ObjectInfo::from_chunks))
    }

    async fn get(&self, dir: &str, address: &str) -> Result<Option<FoundObject>> {
        let location = self.location(dir, address);
        let tx = self
            .pool
            .begin(TxMode::Read, format!("get {}", location))
            .await?;

        let mapped = match lookup(&tx, &location) {
            Ok(mapped) => mapped,
            Err(err) => return tx.finish(Err(err)),
        };
        if let Some(mapped) = mapped {
            return Ok(Some(FoundObject {
                reader: Box::pin(LargeObjectReader::new(tx, mapped.oid)),
                info: ObjectInfo::plain(mapped.size, Some(mapped.modified)),
            }));
        }

        let chunked = lookup(&tx, &join_key(&[&location, CHUNK_INFO_NAME])).map(|m| m.is_some());
        if !tx.finish(chunked)? {
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

    async fn put(
        &self,
        resolver: &mut dyn Resolver,
        dir: &str,
        address: &str,
    ) -> Result<ObjectKey> {
        let mut tx = self
            .pool
            .begin(TxMode::Write, format!("put {}", self.location(dir, address)))
            .await?;
        let result = self.put_in(&mut tx, resolver, dir, address).await;
        tx.finish(result)
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
        let location = self.location(dir, address);
        if self.remove_location(&location).await? {
            return Ok(());
        }

        let tx = self
            .pool
            .begin(TxMode::Read, format!("list {}", location))
            .await?;
        let result = chunk_locations(&tx, &location);
        let (chunks, info) = tx.finish(result)?;

        for chunk in chunks.iter().chain(info.iter()) {
            self.remove_location(chunk).await?;
        }
        Ok(())
    }

    async fn enumerate(&self) -> Result<Vec<StoredItem>> {
        let tx = self
            .pool
            .begin(TxMode::Read, format!("enumerate {}", self.class))
            .await?;
        let result = child_locations(&tx, &self.class);
        let locations = tx.finish(result)?;

        let class_prefix = format!("{}/", self.class);
        let staging_prefix = format!("{}/", STAGING_DIR);
        let items = locations
            .iter()
            .filter_map(|location| location.strip_prefix(&class_prefix))
            .filter(|relative| !relative.starts_with(&staging_prefix))
            .map(|relative| {
                let (dir, address) = split_key(relative);
                StoredItem {
                    dir,
                    address,
                    chunked: false,
                }
            })
            .collect();
        Ok(filter_chunks(items))
    }

    async fn move_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()> {
        let native = dest
            .base()
            .as_any()
            .downcast_ref::<DatabaseStorage>()
            .filter(|target| self.shares_database(target))
            .map(|target| self.transfer_native(dir, address, target, false));
        transfer::with_fallback(
            "move",
            &self.location(dir, address),
            native,
            transfer::move_streaming(self, dir, address, dest),
        )
        .await
    }

    async fn copy_to(&self, dir: &str, address: &str, dest: &dyn StorageServer) -> Result<()> {
        let native = dest
            .base()
            .as_any()
            .downcast_ref::<DatabaseStorage>()
            .filter(|target| self.shares_database(target))
            .map(|target| self.transfer_native(dir, address, target, true));
        transfer::with_fallback(
            "copy",
            &self.location(dir, address),
            native,
            transfer::copy_streaming(self, dir, address, dest),
        )
        .await
    }

    fn locate(&self, dir: &str, address: &str) -> String {
        self.location(dir, address)
    }

    fn dir(&self) -> String {
        format!("db:{}", self.class)
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Database
    }

    async fn calculate_usage(&self) -> Result<Usage> {
        Err(StorageError::Unsupported {
            storage_type: StorageType::Database,
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

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS large_object_ids (
            oid INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS large_object_pages (
            oid INTEGER NOT NULL,
            pageno INTEGER NOT NULL,
            data BLOB NOT NULL,
            PRIMARY KEY (oid, pageno)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS large_objects (
            address TEXT PRIMARY KEY,
            oid INTEGER NOT NULL,
            size INTEGER NOT NULL,
            modified TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn lookup(conn: &Connection, location: &str) -> Result<Option<MappedObject>> {
    let row = conn
        .query_row(
            "SELECT oid, size, modified FROM large_objects WHERE address = ?1",
            params![location],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((oid, size, modified)) => {
            let modified = DateTime::parse_from_rfc3339(&modified)
                .map_err(|e| StorageError::Internal(format!("invalid timestamp {}: {}", modified, e)))?
                .with_timezone(&Utc);
            Ok(Some(MappedObject {
                oid,
                size: size as u64,
                modified,
            }))
        }
        None => Ok(None),
    }
}

fn create_large_object(conn: &Connection) -> Result<i64> {
    conn.execute(
        "INSERT INTO large_object_ids (created_at) VALUES (?1)",
        params![Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn unlink_large_object(conn: &Connection, oid: i64) -> Result<()> {
    conn.execute("DELETE FROM large_object_pages WHERE oid = ?1", params![oid])?;
    conn.execute("DELETE FROM large_object_ids WHERE oid = ?1", params![oid])?;
    Ok(())
}

fn insert_mapping(conn: &Connection, location: &str, oid: i64, size: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO large_objects (address, oid, size, modified) VALUES (?1, ?2, ?3, ?4)",
        params![location, oid, size as i64, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Deletes a mapping and its large object. Returns whether one existed.
fn remove_mapping(conn: &Connection, location: &str) -> Result<bool> {
    let Some(mapped) = lookup(conn, location)? else {
        return Ok(false);
    };
    conn.execute(
        "DELETE FROM large_objects WHERE address = ?1",
        params![location],
    )?;
    unlink_large_object(conn, mapped.oid)?;
    Ok(true)
}

/// Removes whatever is stored at `location`, plain or chunked.
fn clear_object(conn: &Connection, location: &str) -> Result<()> {
    remove_mapping(conn, location)?;
    let (chunks, info) = chunk_locations(conn, location)?;
    for chunk in chunks.iter().chain(info.iter()) {
        remove_mapping(conn, chunk)?;
    }
    Ok(())
}

/// Every mapped location below `parent/`, in key order.
fn child_locations(conn: &Connection, parent: &str) -> Result<Vec<String>> {
    // '0' sorts right after '/', so this range is exactly the `parent/` prefix.
    let lower = format!("{}/", parent);
    let upper = format!("{}0", parent);
    let mut stmt = conn.prepare(
        "SELECT address FROM large_objects WHERE address > ?1 AND address < ?2 ORDER BY address",
    )?;
    let rows = stmt.query_map(params![lower, upper], |row| row.get::<_, String>(0))?;

    let mut locations = Vec::new();
    for row in rows {
        locations.push(row?);
    }
    Ok(locations)
}

/// Chunk locations and the `info.json` location directly below `location`.
fn chunk_locations(conn: &Connection, location: &str) -> Result<(Vec<String>, Option<String>)> {
    let mut chunks = Vec::new();
    let mut info = None;
    for child in child_locations(conn, location)? {
        let Some(name) = child
            .strip_prefix(location)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            continue;
        };
        if name == CHUNK_INFO_NAME {
            info = Some(child.clone());
        } else if is_chunk_name(name) {
            chunks.push(child.clone());
        }
    }
    Ok((chunks, info))
}

fn read_large_object(conn: &Connection, oid: i64) -> Result<Vec<u8>> {
    let mut stmt =
        conn.prepare("SELECT data FROM large_object_pages WHERE oid = ?1 ORDER BY pageno")?;
    let pages = stmt.query_map(params![oid], |row| row.get::<_, Vec<u8>>(0))?;

    let mut data = Vec::new();
    for page in pages {
        data.extend_from_slice(&page?);
    }
    Ok(data)
}

/// Streams writes into pages of one large object inside the caller's
/// transaction.
struct LargeObjectWriter<'c> {
    conn: &'c mut Connection,
    oid: i64,
    next_page: i64,
    buffer: Vec<u8>,
    written: u64,
}

impl<'c> LargeObjectWriter<'c> {
    fn new(conn: &'c mut Connection, oid: i64) -> Self {
        Self {
            conn,
            oid,
            next_page: 0,
            buffer: Vec::with_capacity(LARGE_OBJECT_PAGE_SIZE),
            written: 0,
        }
    }

    fn write_page(&mut self, len: usize) -> Result<()> {
        let page: Vec<u8> = self.buffer.drain(..len).collect();
        self.conn.execute(
            "INSERT INTO large_object_pages (oid, pageno, data) VALUES (?1, ?2, ?3)",
            params![self.oid, self.next_page, page],
        )?;
        self.next_page += 1;
        self.written += len as u64;
        Ok(())
    }

    fn write_full_pages(&mut self) -> Result<()> {
        while self.buffer.len() >= LARGE_OBJECT_PAGE_SIZE {
            self.write_page(LARGE_OBJECT_PAGE_SIZE)?;
        }
        Ok(())
    }

    fn write_remainder(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.write_page(self.buffer.len())?;
        }
        Ok(())
    }

    /// Writes any buffered tail and returns the object size.
    fn finish(mut self) -> Result<u64> {
        self.write_remainder()?;
        Ok(self.written)
    }
}

impl AsyncWrite for LargeObjectWriter<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.buffer.extend_from_slice(buf);
        match this.write_full_pages() {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.get_mut().write_remainder().map_err(io::Error::from))
    }
}

/// Reads one large object page by page. Owns its transaction and pooled
/// connection; both are released at end of stream or when dropped.
struct LargeObjectReader {
    tx: Option<Transaction>,
    oid: i64,
    next_page: i64,
    pending: Bytes,
}

impl LargeObjectReader {
    fn new(tx: Transaction, oid: i64) -> Self {
        Self {
            tx: Some(tx),
            oid,
            next_page: 0,
            pending: Bytes::new(),
        }
    }

    /// Loads the next page; false at end of object.
    fn fill(&mut self) -> Result<bool> {
        let Some(tx) = self.tx.as_ref() else {
            return Ok(false);
        };
        let page = tx
            .query_row(
                "SELECT data FROM large_object_pages WHERE oid = ?1 AND pageno = ?2",
                params![self.oid, self.next_page],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional();

        match page {
            Ok(Some(data)) => {
                self.next_page += 1;
                self.pending = Bytes::from(data);
                Ok(true)
            }
            Ok(None) => self.close(Ok(())).map(|()| false),
            Err(err) => self.close(Err(err.into())).map(|()| false),
        }
    }

    fn close(&mut self, result: Result<()>) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.finish(result),
            None => result,
        }
    }
}

impl AsyncRead for LargeObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match this.fill() {
                Ok(true) => {}
                Ok(false) => return Poll::Ready(Ok(())),
                Err(err) => return Poll::Ready(Err(err.into())),
            }
        }

        let len = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(len));
        Poll::Ready(Ok(()))
    }
}
