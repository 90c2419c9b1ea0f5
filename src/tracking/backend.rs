//! Tracking backend contract.

use super::{RegisteredModel, RunHandle, RunStatus, TrackingError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifiers the backend assigned to a new run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRun {
    pub run_id: String,
    pub artifact_uri: String,
}

/// Params, metrics and tags sent in one call, each list in call order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    pub params: Vec<(String, String)>,
    pub metrics: Vec<(String, f64)>,
    pub tags: Vec<(String, String)>,
}

impl LogBatch {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.metrics.is_empty() && self.tags.is_empty()
    }
}

/// Request to add a model version to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistration {
    pub name: String,
    pub source_uri: String,
    pub run_id: String,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Storage for runs, artifacts and registered models.
///
/// The tracker owns the run state machine; backends only persist what they
/// are told.
#[async_trait]
pub trait TrackingBackend: Send + Sync {
    /// Resolve an experiment by name, creating it if needed. Returns its id.
    async fn ensure_experiment(&self, name: &str) -> Result<String, TrackingError>;

    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<CreatedRun, TrackingError>;

    async fn log_batch(&self, run_id: &str, batch: LogBatch) -> Result<(), TrackingError>;

    /// Store one file at `path` relative to the run's artifact root
    async fn upload_artifact(
        &self,
        run: &RunHandle,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TrackingError>;

    async fn update_run(&self, run_id: &str, status: RunStatus) -> Result<(), TrackingError>;

    /// Register a new version under `registration.name`
    async fn register_model(
        &self,
        registration: &ModelRegistration,
    ) -> Result<RegisteredModel, TrackingError>;
}
