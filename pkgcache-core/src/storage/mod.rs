pub mod database;
pub mod file;
pub mod pool;
pub mod s3;

pub use database::DatabaseStorage;
pub use file::{FileStorage, FileStorageArgs};
pub use pool::{ConnectionPool, Transaction, TxMode};
pub use s3::{S3Storage, S3StorageArgs};
