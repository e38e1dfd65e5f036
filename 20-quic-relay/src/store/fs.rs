//! Local filesystem storage backend
//!
//! One file per object, named by its id, directly under the root directory.
//! Each write lands in its own uniquely named `.part` file first and is renamed
//! into place, so a reader never observes a half-written object and concurrent
//! writers of the same id never share a file. The last rename wins.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info};

use super::{BlobReader, BlobStore, StoreError, validate_object_id};

const PARTIAL_PREFIX: &str = ".upload-";
const PARTIAL_SUFFIX: &str = ".part";

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create storage directory {}", root.display()))?;
        info!(root = %root.display(), "filesystem blob store ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_object_id(id)?;
        // Reserved for in-flight writes.
        if id.ends_with(PARTIAL_SUFFIX) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, id: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.object_path(id)?;
        let root = self.root.clone();
        let size = data.len();

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&root, &target, &data))
            .await
            .map_err(io::Error::other)??;

        debug!(path = %path.display(), bytes = size, "object written");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<BlobReader, StoreError> {
        let path = self.object_path(id)?;
        let file = fs::File::open(&path).await.map_err(|err| not_found(err, id))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.object_path(id)?;
        fs::remove_file(&path).await.map_err(|err| not_found(err, id))
    }
}

fn write_atomically(root: &Path, target: &Path, data: &[u8]) -> io::Result<()> {
    let mut partial = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(root)?;
    partial.write_all(data)?;
    partial.as_file().sync_all()?;
    partial.persist(target).map_err(|err| err.error)?;
    Ok(())
}

fn not_found(err: io::Error, id: &str) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(id.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn roundtrip_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("objects")).await.unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();

        store.put("f1", Bytes::from(data.clone())).await.unwrap();
        assert!(store.root().join("f1").is_file());

        let mut out = Vec::new();
        store.get("f1").await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);

        store.delete("f1").await.unwrap();
        assert!(matches!(store.get("f1").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().to_path_buf()).await.unwrap();
        assert!(matches!(store.delete("ghost").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn concurrent_puts_of_one_id_leave_one_whole_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().to_path_buf()).await.unwrap();
        let large = Bytes::from(vec![b'a'; 200_000]);
        let small = Bytes::from(vec![b'b'; 1000]);

        for _ in 0..20 {
            let (first, second) = tokio::join!(
                store.put("f1", large.clone()),
                store.put("f1", small.clone()),
            );
            first.unwrap();
            second.unwrap();

            let mut out = Vec::new();
            store.get("f1").await.unwrap().read_to_end(&mut out).await.unwrap();
            assert!(out == large || out == small, "mixed object of {} bytes", out.len());
        }

        let mut entries = fs::read_dir(store.root()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["f1".to_string()]);
    }

    #[tokio::test]
    async fn partial_file_names_are_not_valid_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().to_path_buf()).await.unwrap();
        let result = store.put("f1.part", Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(StoreError::InvalidId(_))));
    }

    #[tokio::test]
    async fn ids_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().to_path_buf()).await.unwrap();
        let result = store.put("../escape", Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(StoreError::InvalidId(_))));
    }
}
