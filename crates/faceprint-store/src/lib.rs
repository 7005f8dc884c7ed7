//! faceprint-store: object store gateway for face enrollment data.
//!
//! A flat, key-addressed blob store with prefix listing and signed URL
//! retrieval. Keys are `/`-separated paths such as
//! `face_detection/42/embedding.npy`.

pub mod fs;
pub mod memory;
pub mod signing;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;
pub use signing::UrlSigner;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0:?}")]
    InvalidKey(String),
    #[error("i/o error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("signed url has expired")]
    Expired,
    #[error("signed url signature mismatch")]
    InvalidSignature,
    #[error("url signing key rejected: {0}")]
    SigningKey(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// One entry returned by [`ObjectStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Name relative to the listed prefix (no leading `/`).
    pub name: String,
    pub size: u64,
}

/// Blocking object store interface.
///
/// Listing returns direct children of `prefix` only. Listing order is
/// implementation-defined; callers must not assume chronological order.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError>;
    fn sign(&self, key: &str) -> Result<String, StoreError>;
}

/// Check that `key` is a relative, `/`-separated path with no empty or
/// hidden segments. Hidden segments (leading `.`) are reserved for store
/// bookkeeping and also rule out `.` and `..`.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.contains('\\')
        || key.contains('\0')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment.starts_with('.'));
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
