pub mod error;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
pub use error::StorageError;
use std::collections::HashMap;
use std::fmt;

/// Object metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMetadata {
    /// Object key
    pub key: String,

    /// Object size in bytes
    pub size: u64,

    /// Last modified timestamp
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,

    /// ETag
    pub etag: Option<String>,

    /// User-defined metadata
    pub metadata: HashMap<String, String>,
}

/// Inclusive byte range of an object, as used by HTTP `Range` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: u64,
}

impl ByteRange {
    /// Range covering `len` bytes starting at `start`. `None` for an empty range or one ending
    /// past `u64::MAX`.
    pub fn from_offset(start: u64, len: u64) -> Option<Self> {
        let end_inclusive = start.checked_add(len.checked_sub(1)?)?;
        Some(Self { start, end_inclusive })
    }

    /// Number of bytes covered by the range
    pub fn size(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }

    /// Value of the `Range` header
    pub fn header(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end_inclusive)
    }
}

/// Trait defining object storage operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Get the whole object stored under `key`
    async fn get_data(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Get a byte range of the object stored under `key`, in a single request
    async fn get_range(&self, key: &str, range: ByteRange) -> Result<Bytes, StorageError>;

    /// Store `data` under `key`
    async fn put_data(&self, data: Bytes, key: &str) -> Result<(), StorageError>;

    /// Store `data` under `key` together with user-defined metadata
    async fn put_data_with_metadata(
        &self,
        data: Bytes,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError>;

    /// Object metadata, or `None` when the key does not exist
    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, StorageError>;

    /// User-defined metadata of an existing object
    async fn get_metadata(&self, key: &str) -> Result<HashMap<String, String>, StorageError>;

    /// Delete the object stored under `key`
    async fn delete_data(&self, key: &str) -> Result<(), StorageError>;

    /// List keys below `prefix`, relative to it
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Perform a health check on the storage service
    ///
    /// This method verifies that the storage service (e.g., AWS S3) is accessible
    /// and the necessary permissions are in place.
    async fn health_check(&self) -> Result<(), StorageError>;
}
