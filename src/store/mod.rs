//! Object Store Adapters
//!
//! One contract over every storage backend the pipeline can persist dataset
//! splits to:
//!
//! - `exists` - probe whether the bucket/container is provisioned
//! - `provision` - create it
//! - `put` - upload one object, overwriting
//! - `get` - download one object in full
//!
//! The dataset store and the orchestrator only ever see `dyn ObjectStore`.
//!
//! ## Backends
//!
//! - [`BucketStore`] - S3 API bucket (cargo feature `s3`)
//! - [`ContainerStore`] - Azure blob container behind a named datastore
//! - [`LocalDirStore`] - directory on the local filesystem
//! - [`InMemoryObjectStore`] - process-local map, used by tests

mod bucket;
mod container;
mod local;
mod memory;

#[cfg(test)]
mod tests;

pub use bucket::{BucketConfig, BucketStore};
pub use container::{ContainerConfig, ContainerCredential, ContainerStore};
pub use local::LocalDirStore;
pub use memory::{InMemoryObjectStore, StoreCall};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

// ============================================================================
// Locations
// ============================================================================

/// Kind of backend a location lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// S3-style bucket
    Bucket,
    /// Azure-style blob container
    Container,
    /// Directory on the local filesystem
    Local,
    /// Process-local map
    Memory,
}

impl BackendKind {
    /// URI scheme used when displaying locations
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Bucket => "s3",
            Self::Container => "azureml",
            Self::Local => "file",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bucket => write!(f, "bucket"),
            Self::Container => write!(f, "container"),
            Self::Local => write!(f, "local"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// One object in one backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation {
    pub kind: BackendKind,
    /// Bucket, container/datastore, or directory name
    pub identifier: String,
    /// Object key inside the backend
    pub key: String,
}

impl StorageLocation {
    pub fn new(kind: BackendKind, identifier: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.kind.scheme(), self.identifier, self.key)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by object store adapters
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {operation} on {target} failed: {message}")]
    Unavailable {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("object not found: {0}")]
    ObjectNotFound(StorageLocation),

    #[error("failed to read local file {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn unavailable(
        operation: &'static str,
        target: impl fmt::Display,
        message: impl fmt::Display,
    ) -> Self {
        Self::Unavailable {
            operation,
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    /// True for the "object does not exist" case
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_))
    }
}

// ============================================================================
// Contract
// ============================================================================

/// Uniform contract over bucket and container backends.
///
/// `provision` is only meant to be called after `exists` returned false.
/// The probe-then-create sequence is not atomic; callers serialize it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend kind
    fn kind(&self) -> BackendKind;

    /// Bucket/container name this store is bound to
    fn identifier(&self) -> &str;

    /// Resolve a key to a full location
    fn location(&self, key: &str) -> StorageLocation {
        StorageLocation::new(self.kind(), self.identifier(), key)
    }

    /// Whether the bucket/container is already provisioned
    async fn exists(&self) -> Result<bool, StoreError>;

    /// Create the bucket/container
    async fn provision(&self) -> Result<(), StoreError>;

    /// Upload a payload, overwriting any object at `key`
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Download the object at `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Upload every file below `dir` keyed by its base name.
///
/// Directory structure is flattened: two files with the same name in
/// different sub-directories land on the same key and the later one in walk
/// order wins.
pub async fn upload_dir(
    store: &dyn ObjectStore,
    dir: &Path,
    prefix: Option<&str>,
) -> Result<Vec<StorageLocation>, StoreError> {
    let files = collect_files(dir)?;
    info!(
        "Uploading {} files from {} to {}://{}",
        files.len(),
        dir.display(),
        store.kind().scheme(),
        store.identifier()
    );

    let mut uploaded = Vec::with_capacity(files.len());
    for path in files {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let key = match prefix {
            Some(p) if !p.is_empty() => format!("{}/{}", p.trim_end_matches('/'), name),
            _ => name,
        };
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| StoreError::LocalIo {
                path: path.clone(),
                source,
            })?;
        debug!("put {} ({} bytes)", key, bytes.len());
        store.put(&key, bytes).await?;
        uploaded.push(store.location(&key));
    }
    Ok(uploaded)
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| StoreError::LocalIo {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}
