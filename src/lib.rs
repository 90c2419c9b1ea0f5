//! labflow: dataset storage, experiment tracking, model registration and
//! deployment for small classifier experiments.
//!
//! Components, leaves first:
//!
//! - [`store`] - object store adapters (bucket, blob container, local, memory)
//! - [`codec`] - `.npy` array encoding
//! - [`dataset`] - the six train/val/test splits over a store
//! - [`tracking`] - runs, params, metrics, artifacts, model registry
//! - [`deploy`] - idempotent named deployments
//! - [`train`] - the per-model training loop
//! - [`inference`] - querying a deployed endpoint

pub mod codec;
pub mod config;
pub mod dataset;
pub mod deploy;
pub mod inference;
pub mod store;
pub mod tracking;
pub mod train;

// Re-export key types for convenience
pub use config::{ConfigError, LabConfig};
pub use dataset::{DatasetError, DatasetSplits, DatasetStore, SplitAxis, SplitRole};
pub use deploy::{DeployError, Deployment, DeploymentClient, DeploymentConfig};
pub use inference::InferenceClient;
pub use store::{ObjectStore, StorageLocation, StoreError};
pub use tracking::{ExperimentTracker, RunHandle, RunSpec, RunStatus, TrackingError};
pub use train::{BatchReport, Classifier, PipelineError, TrainingOrchestrator, TrainingSettings};
