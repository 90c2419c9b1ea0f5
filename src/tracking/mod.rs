//! Experiment Tracking
//!
//! Records training runs, their parameters, metrics and artifacts, and
//! registers trained models under a canonical name.
//!
//! Runs are addressed through an explicit [`RunHandle`]: there is no ambient
//! "active run". A child run is opened by passing its parent's handle in the
//! [`RunSpec`], and a parent cannot be closed while any child is still open.
//!
//! ## Backends
//!
//! - [`MlflowBackend`] - MLflow tracking server over its REST API
//! - [`InMemoryTrackingBackend`] - process-local recorder used by tests and
//!   dry runs

mod backend;
mod memory;
mod mlflow;
mod tracker;

#[cfg(test)]
mod tests;

pub use backend::{CreatedRun, LogBatch, ModelRegistration, TrackingBackend};
pub use memory::{InMemoryTrackingBackend, RecordedRun, TrackingCall};
pub use mlflow::MlflowBackend;
pub use tracker::ExperimentTracker;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Tag carrying the parent run id, as understood by the MLflow UI
pub const PARENT_RUN_TAG: &str = "mlflow.parentRunId";

/// Descriptor file written next to every logged model
pub const MODEL_DESCRIPTOR_FILE: &str = "MLmodel";

/// Serialized model payload written next to the descriptor
pub const MODEL_PAYLOAD_FILE: &str = "model.json";

// ============================================================================
// Runs
// ============================================================================

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Wire name used by the tracking server
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to one started run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
    pub experiment_id: String,
    pub name: String,
    pub parent_run_id: Option<String>,
    /// Root URI artifacts of this run are stored under
    pub artifact_uri: String,
}

impl RunHandle {
    pub fn is_nested(&self) -> bool {
        self.parent_run_id.is_some()
    }
}

/// Parameters for [`ExperimentTracker::start_run`]
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub parent: Option<RunHandle>,
}

impl RunSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: &BTreeMap<String, String>) -> Self {
        self.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Open the run as a child of `parent`
    #[must_use]
    pub fn nested_in(mut self, parent: &RunHandle) -> Self {
        self.parent = Some(parent.clone());
        self
    }
}

// ============================================================================
// Models
// ============================================================================

/// A model in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    pub version: u64,
    pub source_uri: String,
    pub run_id: String,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Serializable representation of a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Loader flavor recorded in the descriptor, e.g. `python_function`
    pub flavor: String,
    /// Classifier kind, e.g. `nearest_centroid`
    pub classifier: String,
    pub payload: serde_json::Value,
}

impl ModelArtifact {
    pub fn new(classifier: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            flavor: "python_function".to_string(),
            classifier: classifier.into(),
            payload,
        }
    }

    #[must_use]
    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = flavor.into();
        self
    }
}

/// Registry name for a human-readable model name: whitespace runs become `_`
pub fn canonical_model_name(display_name: &str) -> String {
    display_name.split_whitespace().collect::<Vec<_>>().join("_")
}

/// `runs:/<run_id>/<artifact_path>`
pub fn model_source_uri(run_id: &str, artifact_path: &str) -> String {
    format!("runs:/{}/{}", run_id, artifact_path.trim_matches('/'))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("run {run_id} is not active")]
    RunNotActive { run_id: String },

    #[error("parent run {run_id} is not active")]
    ParentNotActive { run_id: String },

    #[error("run {run_id} still has open child runs: {}", children.join(", "))]
    OpenChildRuns {
        run_id: String,
        children: Vec<String>,
    },

    #[error("run {run_id} has no logged model to register")]
    NoActiveModelArtifact { run_id: String },

    #[error("tracking backend error during {operation}: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    #[error("artifact {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialize(String),
}

impl TrackingError {
    pub(crate) fn backend(operation: &'static str, message: impl fmt::Display) -> Self {
        Self::Backend {
            operation,
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for TrackingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e.to_string())
    }
}

impl From<serde_yaml::Error> for TrackingError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialize(e.to_string())
    }
}
