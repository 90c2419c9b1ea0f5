//! Local directory backend.
//!
//! `root/<name>/` plays the role of the bucket. Writes go to a temporary
//! file in the same directory and are renamed into place, so readers never
//! see a partial object.

use super::{BackendKind, ObjectStore, StoreError};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Object store rooted in a local directory
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
    name: String,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
        }
    }

    /// Directory holding the objects
    pub fn container_dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.container_dir().join(key)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("object path has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn identifier(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> Result<bool, StoreError> {
        match tokio::fs::metadata(self.container_dir()).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::unavailable(
                "exists",
                self.container_dir().display(),
                e,
            )),
        }
    }

    async fn provision(&self) -> Result<(), StoreError> {
        let dir = self.container_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::unavailable("provision", dir.display(), e))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.object_path(key);
        let target = self.location(key);
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::unavailable("put", &target, e))?
            .map_err(|e| StoreError::unavailable("put", &target, e))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ObjectNotFound(self.location(key)))
            }
            Err(e) => Err(StoreError::unavailable("get", self.location(key), e)),
        }
    }
}
