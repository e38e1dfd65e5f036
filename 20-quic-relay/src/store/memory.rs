use std::collections::HashMap;
use std::io::Cursor;

use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BlobReader, BlobStore, StoreError, validate_object_id};

/// Keeps every object in a map; contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, id: &str, data: Bytes) -> Result<(), StoreError> {
        validate_object_id(id)?;
        self.objects.write().await.insert(id.to_string(), data);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<BlobReader, StoreError> {
        validate_object_id(id)?;
        // Bytes clones are refcounted, so the reader never holds the lock.
        let data = self
            .objects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        validate_object_id(id)?;
        self.objects
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
