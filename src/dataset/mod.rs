//! Dataset Store
//!
//! Persists the six canonical splits of a tabular dataset to an
//! [`ObjectStore`] and reads them back for training.
//!
//! ## Layout
//!
//! | Role  | Features      | Labels        |
//! |-------|---------------|---------------|
//! | train | `X_train.npy` | `y_train.npy` |
//! | val   | `X_val.npy`   | `y_val.npy`   |
//! | test  | `X_test.npy`  | `y_test.npy`  |
//!
//! Keys are placed under an optional sub-path when the store was built with
//! [`DatasetStore::with_prefix`].
//!
//! ## Provisioning
//!
//! [`DatasetStore::ensure_provisioned`] probes, then creates the container if
//! absent. The outcome is remembered for the lifetime of the `DatasetStore`,
//! so one process issues at most one probe and one create. The sequence is
//! not atomic across processes: two processes provisioning the same
//! container at once may both see it missing.

pub mod prepare;


use crate::codec::{self, CodecError, NpyArray};
use crate::store::{upload_dir, ObjectStore, StorageLocation, StoreError};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Split naming
// ============================================================================

/// Which partition of the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitRole {
    Train,
    Val,
    Test,
}

impl SplitRole {
    pub const ALL: [SplitRole; 3] = [SplitRole::Train, SplitRole::Val, SplitRole::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            SplitRole::Train => "train",
            SplitRole::Val => "val",
            SplitRole::Test => "test",
        }
    }
}

impl fmt::Display for SplitRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Features (`X`) or labels (`y`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitAxis {
    Features,
    Labels,
}

impl SplitAxis {
    pub const ALL: [SplitAxis; 2] = [SplitAxis::Features, SplitAxis::Labels];

    pub fn symbol(&self) -> &'static str {
        match self {
            SplitAxis::Features => "X",
            SplitAxis::Labels => "y",
        }
    }
}

impl fmt::Display for SplitAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Canonical object name, e.g. `X_train.npy`
pub fn split_key(role: SplitRole, axis: SplitAxis) -> String {
    format!("{}_{}.npy", axis.symbol(), role.as_str())
}

// ============================================================================
// Splits
// ============================================================================

/// The six arrays of a prepared dataset
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplits {
    pub x_train: Array2<f64>,
    pub x_val: Array2<f64>,
    pub x_test: Array2<f64>,
    pub y_train: Array1<i64>,
    pub y_val: Array1<i64>,
    pub y_test: Array1<i64>,
}

impl DatasetSplits {
    pub fn features(&self, role: SplitRole) -> &Array2<f64> {
        match role {
            SplitRole::Train => &self.x_train,
            SplitRole::Val => &self.x_val,
            SplitRole::Test => &self.x_test,
        }
    }

    pub fn labels(&self, role: SplitRole) -> &Array1<i64> {
        match role {
            SplitRole::Train => &self.y_train,
            SplitRole::Val => &self.y_val,
            SplitRole::Test => &self.y_test,
        }
    }

    /// Every role must have as many label entries as feature rows
    pub fn validate(&self) -> Result<(), DatasetError> {
        for role in SplitRole::ALL {
            let x_rows = self.features(role).nrows();
            let y_rows = self.labels(role).len();
            if x_rows != y_rows {
                return Err(DatasetError::InconsistentSplit {
                    role,
                    x_rows,
                    y_rows,
                });
            }
        }
        Ok(())
    }

    /// Rows across train, val and test
    pub fn total_rows(&self) -> usize {
        SplitRole::ALL
            .iter()
            .map(|r| self.features(*r).nrows())
            .sum()
    }

    /// Feature columns (taken from the training split)
    pub fn n_features(&self) -> usize {
        self.x_train.ncols()
    }

    fn encoded(&self, role: SplitRole, axis: SplitAxis) -> NpyArray {
        match axis {
            SplitAxis::Features => NpyArray::from(self.features(role).clone()),
            SplitAxis::Labels => NpyArray::from(self.labels(role).clone()),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("split {axis}_{role} not found at {location}")]
    SplitNotFound {
        role: SplitRole,
        axis: SplitAxis,
        location: StorageLocation,
    },

    #[error("upload of {key} failed: {source}")]
    UploadFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("{role} split has {x_rows} feature rows but {y_rows} labels")]
    InconsistentSplit {
        role: SplitRole,
        x_rows: usize,
        y_rows: usize,
    },

    #[error("{key} has unexpected shape: {message}")]
    UnexpectedShape { key: String, message: String },

    #[error("{path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Store
// ============================================================================

/// Reads and writes dataset splits through an object store
pub struct DatasetStore {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    provisioned: AtomicBool,
}

impl fmt::Debug for DatasetStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetStore")
            .field("backend", &self.store.kind())
            .field("identifier", &self.store.identifier())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl DatasetStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: None,
            provisioned: AtomicBool::new(false),
        }
    }

    /// Place every split under `prefix/`
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn backend(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Object key for a split, including the prefix
    pub fn key_for(&self, role: SplitRole, axis: SplitAxis) -> String {
        match &self.prefix {
            Some(p) => format!("{}/{}", p, split_key(role, axis)),
            None => split_key(role, axis),
        }
    }

    pub fn location(&self, role: SplitRole, axis: SplitAxis) -> StorageLocation {
        self.store.location(&self.key_for(role, axis))
    }

    /// Create the container if it does not exist yet.
    ///
    /// Idempotent. Callers serialize concurrent invocations.
    pub async fn ensure_provisioned(&self) -> Result<(), StoreError> {
        if self.provisioned.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.store.exists().await? {
            debug!(
                "{}://{} already provisioned",
                self.store.kind().scheme(),
                self.store.identifier()
            );
        } else {
            info!(
                "Provisioning {}://{}",
                self.store.kind().scheme(),
                self.store.identifier()
            );
            self.store.provision().await?;
        }
        self.provisioned.store(true, Ordering::Release);
        Ok(())
    }

    /// Encode and upload one split
    pub async fn upload_split(
        &self,
        role: SplitRole,
        axis: SplitAxis,
        array: &NpyArray,
    ) -> Result<StorageLocation, DatasetError> {
        let key = self.key_for(role, axis);
        let bytes = codec::encode(array).map_err(|source| DatasetError::Codec {
            key: key.clone(),
            source,
        })?;

        let upload_failed = |source: StoreError| DatasetError::UploadFailed {
            key: key.clone(),
            source,
        };
        self.ensure_provisioned().await.map_err(upload_failed)?;
        debug!("put {} ({} bytes, shape {:?})", key, bytes.len(), array.shape());
        self.store.put(&key, bytes).await.map_err(upload_failed)?;
        Ok(self.store.location(&key))
    }

    /// Upload all six splits.
    ///
    /// A failed split is logged and reported in its slot; the remaining splits
    /// are still attempted.
    pub async fn upload_splits(
        &self,
        splits: &DatasetSplits,
    ) -> Vec<(String, Result<StorageLocation, DatasetError>)> {
        let mut results = Vec::with_capacity(6);
        for role in SplitRole::ALL {
            for axis in SplitAxis::ALL {
                let key = split_key(role, axis);
                let result = self
                    .upload_split(role, axis, &splits.encoded(role, axis))
                    .await;
                if let Err(e) = &result {
                    warn!("Skipping {}: {}", key, e);
                }
                results.push((key, result));
            }
        }
        results
    }

    /// Upload every file under `dir`, flattened to base names
    pub async fn upload_directory(&self, dir: &Path) -> Result<Vec<StorageLocation>, DatasetError> {
        self.ensure_provisioned().await?;
        Ok(upload_dir(self.store.as_ref(), dir, self.prefix.as_deref()).await?)
    }

    /// Download and decode one split
    pub async fn download_split(
        &self,
        role: SplitRole,
        axis: SplitAxis,
    ) -> Result<NpyArray, DatasetError> {
        let key = self.key_for(role, axis);
        let bytes = match self.store.get(&key).await {
            Ok(bytes) => bytes,
            Err(StoreError::ObjectNotFound(location)) => {
                return Err(DatasetError::SplitNotFound {
                    role,
                    axis,
                    location,
                })
            }
            Err(e) => return Err(e.into()),
        };
        debug!("get {} ({} bytes)", key, bytes.len());
        codec::decode(&bytes).map_err(|source| DatasetError::Codec { key, source })
    }

    /// Download all six splits concurrently.
    ///
    /// The first failure wins; the other in-flight downloads are dropped.
    pub async fn download_all_splits(&self) -> Result<DatasetSplits, DatasetError> {
        use SplitRole::{Test, Train, Val};

        let (x_train, x_val, x_test, y_train, y_val, y_test) = tokio::try_join!(
            self.download_features(Train),
            self.download_features(Val),
            self.download_features(Test),
            self.download_labels(Train),
            self.download_labels(Val),
            self.download_labels(Test),
        )?;

        let splits = DatasetSplits {
            x_train,
            x_val,
            x_test,
            y_train,
            y_val,
            y_test,
        };
        splits.validate()?;
        info!(
            "Downloaded dataset: {} rows, {} features",
            splits.total_rows(),
            splits.n_features()
        );
        Ok(splits)
    }

    async fn download_features(&self, role: SplitRole) -> Result<Array2<f64>, DatasetError> {
        let array = self.download_split(role, SplitAxis::Features).await?;
        array
            .into_features()
            .map_err(|e| self.unexpected_shape(role, SplitAxis::Features, e))
    }

    async fn download_labels(&self, role: SplitRole) -> Result<Array1<i64>, DatasetError> {
        let array = self.download_split(role, SplitAxis::Labels).await?;
        array
            .into_labels()
            .map_err(|e| self.unexpected_shape(role, SplitAxis::Labels, e))
    }

    fn unexpected_shape(&self, role: SplitRole, axis: SplitAxis, err: CodecError) -> DatasetError {
        DatasetError::UnexpectedShape {
            key: self.key_for(role, axis),
            message: err.to_string(),
        }
    }
}
