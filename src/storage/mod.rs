//! Object-store contract.
//!
//! The vault persists wrapped DEK records in a durable key-value blob store
//! (in production an S3-compatible bucket). Keys are UTF-8 strings made of
//! `/`-delimited segments; prefix listing must be consistent enough to
//! enumerate every record under a ring or under the whole vault.
//!
//! Backends are replaceable. Two ship with the crate:
//! - [`MemoryObjectStore`] for tests and single-process use.
//! - [`LocalObjectStore`] which maps keys to files below a root directory.

use async_trait::async_trait;

use crate::error::VaultError;

mod local;
mod memory;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

/// Errors raised by object-store backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be reached or refused the call.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured deadline.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    /// The object key is not acceptable to this backend.
    #[error("invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidKey(_) => VaultError::Encoding(err.to_string()),
            other => VaultError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Durable blob storage with byte-for-byte get/put and prefix listing.
///
/// All operations are async; dropping the returned future cancels the call.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous object.
    async fn put_object(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Fetch the object under `key`. `Ok(None)` means it does not exist.
    async fn get_object(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// List every key starting with `prefix`, in lexicographic order.
    async fn list_object_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;
}
