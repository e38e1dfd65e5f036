//! Object storage for files relayed through the server.
//!
//! The dispatcher only ever talks to [`BlobStore`]. Two backends ship with the
//! crate:
//! - [`MemoryBlobStore`] keeps objects in process memory
//! - [`FsBlobStore`] keeps one file per object under a root directory

mod fs;
mod memory;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Longest object id accepted by any backend.
pub const MAX_OBJECT_ID_LEN: usize = 255;

/// Streaming view of a stored object.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {0:?} not found")]
    NotFound(String),
    #[error("invalid object id {0:?}")]
    InvalidId(String),
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Storage backend trait
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `id`, replacing any previous object
    async fn put(&self, id: &str, data: Bytes) -> Result<(), StoreError>;

    /// Open the object stored under `id`
    async fn get(&self, id: &str) -> Result<BlobReader, StoreError>;

    /// Delete the object stored under `id`
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Which backend the server should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Directory(PathBuf),
}

pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match config {
        StoreConfig::Memory => Arc::new(MemoryBlobStore::new()),
        StoreConfig::Directory(root) => Arc::new(FsBlobStore::open(root.clone()).await?),
    };
    Ok(store)
}

/// Rejects ids that are empty, oversized, or could escape a directory.
pub fn validate_object_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_OBJECT_ID_LEN
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}
