use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod s3;

pub use s3::S3Storage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Object is {size} bytes, larger than the {max} byte limit")]
    TooLarge { size: u64, max: usize },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Read access to uploaded attachments. Uploads are handled by another service.
#[async_trait]
pub trait ObjectStorage: Send + Sync + std::fmt::Debug + 'static {
    /// Fetches a whole object, refusing anything larger than `max_size` bytes.
    async fn get(&self, key: &str, max_size: usize) -> Result<StoredObject, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}
