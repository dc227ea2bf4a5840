use crate::types::StorageType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("metadata not found for chunked asset {0}")]
    NoChunkMetadata(String),

    #[error("chunk {chunk} not found for chunked asset {key}")]
    NoChunk { key: String, chunk: u64 },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("chunked asset {0} is incomplete")]
    Incomplete(String),

    #[error("{operation} is not supported by {storage_type} storage")]
    Unsupported {
        storage_type: StorageType,
        operation: &'static str,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Strips any `Context` wrappers.
    pub fn root(&self) -> &StorageError {
        match self {
            StorageError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            StorageError::NotFound(_) | StorageError::NoChunkMetadata(_) => true,
            StorageError::ObjectStore(object_store::Error::NotFound { .. }) => true,
            StorageError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when a reader gave up waiting for data that never arrived.
    pub fn is_chunk_timeout(&self) -> bool {
        matches!(
            self.root(),
            StorageError::NoChunk { .. } | StorageError::Timeout(_)
        )
    }

    pub fn is_backend_failure(&self) -> bool {
        match self.root() {
            StorageError::Io(err) => err.kind() != std::io::ErrorKind::NotFound,
            StorageError::ObjectStore(err) => {
                !matches!(err, object_store::Error::NotFound { .. })
            }
            StorageError::Database(_) | StorageError::Serialization(_) => true,
            _ => false,
        }
    }
}

// Chunked readers surface failures through `AsyncRead`, so a `StorageError`
// travels inside an `io::Error` and is recovered here.
impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        let carries_storage_error = err
            .get_ref()
            .is_some_and(|inner| inner.is::<StorageError>());
        if !carries_storage_error {
            return StorageError::Io(err);
        }

        match err.into_inner().map(|inner| inner.downcast::<StorageError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => StorageError::Io(std::io::Error::other(other)),
            None => StorageError::Internal("empty I/O error".to_string()),
        }
    }
}

impl From<StorageError> for std::io::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(inner) => inner,
            other => std::io::Error::other(other),
        }
    }
}

pub trait ResultExt<T> {
    /// Wraps the error with a description of the operation and key.
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<StorageError>,
{
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| StorageError::Context {
            context: context().into(),
            source: Box::new(err.into()),
        })
    }
}
