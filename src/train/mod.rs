//! Training Orchestrator
//!
//! Trains a set of classifiers against one dataset and records each attempt
//! as a child run of a single parent run.
//!
//! ## Flow
//!
//! 1. Download all six splits (fails the whole batch if any is missing)
//! 2. Open the parent run and log the random seed
//! 3. For each model, in insertion order: fit, validate, log, register and
//!    optionally deploy inside its own child run
//! 4. Close the parent
//!
//! A failure inside one model's iteration is logged, recorded in the
//! [`BatchReport`], and the loop moves on to the next model. The parent run
//! ends `Failed` when every model failed, and also when the batch itself
//! errors out after the parent was opened.

pub mod baseline;
pub mod metrics;

#[cfg(test)]
mod tests;

pub use baseline::{builtin, MajorityClass, NearestCentroid, BUILTIN_CLASSIFIERS};
pub use metrics::{accuracy, ConfusionMatrix};

use crate::dataset::{DatasetError, DatasetSplits, DatasetStore};
use crate::deploy::{Deployment, DeploymentClient};
use crate::tracking::{
    ExperimentTracker, ModelArtifact, RegisteredModel, RunHandle, RunSpec, RunStatus,
    TrackingError,
};
use anyhow::Context;
use indexmap::IndexMap;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

/// File the validation confusion matrix is written to, inside a model's
/// scratch directory
pub const CONFUSION_MATRIX_FILE: &str = "confusion_matrix.csv";

/// Artifact path models are logged under
pub const MODEL_ARTIFACT_PATH: &str = "model";

// ============================================================================
// Classifier contract
// ============================================================================

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model has not been fitted")]
    NotFitted,

    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("{rows} feature rows but {labels} labels")]
    LengthMismatch { rows: usize, labels: usize },

    #[error("expected {expected} features, got {actual}")]
    FeatureMismatch { expected: usize, actual: usize },

    #[error("model serialization failed: {0}")]
    Serialize(String),

    #[error("{0}")]
    Other(String),
}

/// A trainable classifier
pub trait Classifier: Send {
    /// Stable identifier, e.g. `nearest_centroid`
    fn kind(&self) -> &'static str;

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<i64>) -> Result<(), ModelError>;

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<i64>, ModelError>;

    /// Hyperparameters to log with the run
    fn params(&self) -> BTreeMap<String, String>;

    fn to_artifact(&self) -> Result<ModelArtifact, ModelError>;
}

// ============================================================================
// Settings and results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Name of the parent run
    pub run_name: String,
    pub random_seed: u64,
    /// Local directory each child run's scratch directory is created in
    pub artifact_dir: PathBuf,
    /// Tags applied to the parent and every child run
    pub tags: BTreeMap<String, String>,
    /// Deploy each registered model under this name when set
    pub deployment_name: Option<String>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            run_name: "classifier_train".to_string(),
            random_seed: crate::dataset::prepare::DEFAULT_SEED,
            artifact_dir: std::env::temp_dir().join("labflow-artifacts"),
            tags: BTreeMap::new(),
            deployment_name: None,
        }
    }
}

/// What happened to one model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelOutcome {
    pub model: String,
    /// Child run id; `None` when the run could not even be opened
    pub run_id: Option<String>,
    pub status: RunStatus,
    pub val_accuracy: Option<f64>,
    pub registered: Option<RegisteredModel>,
    pub deployment: Option<Deployment>,
    pub error: Option<String>,
}

impl ModelOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Finished
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub parent_run_id: String,
    pub parent_status: RunStatus,
    /// In the order the models were trained
    pub outcomes: Vec<ModelOutcome>,
}

impl BatchReport {
    pub fn outcome(&self, model: &str) -> Option<&ModelOutcome> {
        self.outcomes.iter().find(|o| o.model == model)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Best validation accuracy among successful models
    pub fn best(&self) -> Option<&ModelOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.is_success())
            .max_by(|a, b| {
                a.val_accuracy
                    .unwrap_or(f64::MIN)
                    .total_cmp(&b.val_accuracy.unwrap_or(f64::MIN))
            })
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("dataset: {0}")]
    Dataset(#[from] DatasetError),

    #[error("tracking: {0}")]
    Tracking(#[from] TrackingError),

    #[error("configuration: {0}")]
    Config(String),
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Result of one successful model iteration
struct Trained {
    val_accuracy: f64,
    registered: RegisteredModel,
    deployment: Option<Deployment>,
}

pub struct TrainingOrchestrator<'a> {
    dataset: &'a DatasetStore,
    tracker: &'a ExperimentTracker,
    deployer: Option<&'a DeploymentClient>,
    settings: TrainingSettings,
}

impl<'a> TrainingOrchestrator<'a> {
    pub fn new(
        dataset: &'a DatasetStore,
        tracker: &'a ExperimentTracker,
        settings: TrainingSettings,
    ) -> Self {
        Self {
            dataset,
            tracker,
            deployer: None,
            settings,
        }
    }

    /// Deploy every registered model through `deployer`
    #[must_use]
    pub fn with_deployer(mut self, deployer: &'a DeploymentClient) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    /// Train every model in `models`, in insertion order
    pub async fn run(
        &self,
        models: IndexMap<String, Box<dyn Classifier>>,
    ) -> Result<BatchReport, PipelineError> {
        if models.is_empty() {
            return Err(PipelineError::Config("no classifiers to train".to_string()));
        }
        if self.deployer.is_some() && self.settings.deployment_name.is_none() {
            return Err(PipelineError::Config(
                "a deployer is configured but no deployment name was given".to_string(),
            ));
        }

        let splits = self.dataset.download_all_splits().await?;
        std::fs::create_dir_all(&self.settings.artifact_dir).map_err(|e| {
            PipelineError::Config(format!(
                "cannot create artifact dir {}: {e}",
                self.settings.artifact_dir.display()
            ))
        })?;

        let parent = self
            .tracker
            .start_run(RunSpec::new(&self.settings.run_name).with_tags(&self.settings.tags))
            .await?;
        let outcomes = match self.train_all(&parent, &splits, models).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.abort_parent(&parent).await;
                return Err(e);
            }
        };

        let parent_status = if outcomes.iter().all(|o| !o.is_success()) {
            RunStatus::Failed
        } else {
            RunStatus::Finished
        };
        if let Err(e) = self.tracker.end_run(&parent, parent_status).await {
            self.abort_parent(&parent).await;
            return Err(e.into());
        }

        let report = BatchReport {
            parent_run_id: parent.run_id,
            parent_status,
            outcomes,
        };
        info!(
            "Batch finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }

    async fn train_all(
        &self,
        parent: &RunHandle,
        splits: &DatasetSplits,
        models: IndexMap<String, Box<dyn Classifier>>,
    ) -> Result<Vec<ModelOutcome>, PipelineError> {
        self.tracker
            .log_params(parent, [("random_seed", self.settings.random_seed)])
            .await?;

        let mut outcomes = Vec::with_capacity(models.len());
        for (name, model) in models {
            outcomes.push(self.train_model(parent, splits, name, model).await);
        }
        Ok(outcomes)
    }

    async fn abort_parent(&self, parent: &RunHandle) {
        if let Err(e) = self.tracker.abort_run(parent).await {
            warn!("Could not close parent run {}: {}", parent.run_id, e);
        }
    }

    async fn train_model(
        &self,
        parent: &RunHandle,
        splits: &DatasetSplits,
        name: String,
        mut model: Box<dyn Classifier>,
    ) -> ModelOutcome {
        let mut outcome = ModelOutcome {
            model: name.clone(),
            run_id: None,
            status: RunStatus::Failed,
            val_accuracy: None,
            registered: None,
            deployment: None,
            error: None,
        };

        let spec = RunSpec::new(&name)
            .with_tags(&self.settings.tags)
            .nested_in(parent);
        let child = match self.tracker.start_run(spec).await {
            Ok(child) => child,
            Err(e) => {
                warn!("Could not open a run for {}: {}", name, e);
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };
        outcome.run_id = Some(child.run_id.clone());

        info!("Fitting {}...", name);
        let result = self
            .train_in_run(&child, splits, &name, model.as_mut())
            .await;
        let status = match &result {
            Ok(_) => RunStatus::Finished,
            Err(_) => RunStatus::Failed,
        };

        match result {
            Ok(trained) => {
                info!("{}: validation accuracy {:.4}", name, trained.val_accuracy);
                outcome.val_accuracy = Some(trained.val_accuracy);
                outcome.registered = Some(trained.registered);
                outcome.deployment = trained.deployment;
            }
            Err(e) => {
                warn!("Training {} failed: {:#}", name, e);
                outcome.error = Some(format!("{e:#}"));
            }
        }

        match self.tracker.end_run(&child, status).await {
            Ok(()) => outcome.status = status,
            Err(e) => {
                warn!("Could not close run {}: {}", child.run_id, e);
                outcome.status = RunStatus::Failed;
                outcome.error.get_or_insert_with(|| e.to_string());
            }
        }
        outcome
    }

    async fn train_in_run(
        &self,
        run: &RunHandle,
        splits: &DatasetSplits,
        name: &str,
        model: &mut dyn Classifier,
    ) -> anyhow::Result<Trained> {
        model
            .fit(&splits.x_train, &splits.y_train)
            .with_context(|| format!("fitting {name}"))?;
        let predicted = model
            .predict(&splits.x_val)
            .with_context(|| format!("predicting validation split with {name}"))?;
        if predicted.len() != splits.y_val.len() {
            anyhow::bail!(
                "{name} returned {} predictions for {} validation rows",
                predicted.len(),
                splits.y_val.len()
            );
        }
        let val_accuracy = accuracy(&splits.y_val, &predicted);

        // Removed on drop; only this run's files get uploaded.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", run.run_id))
            .tempdir_in(&self.settings.artifact_dir)
            .with_context(|| {
                format!("creating scratch dir in {}", self.settings.artifact_dir.display())
            })?;
        let matrix = ConfusionMatrix::from_predictions(&splits.y_val, &predicted);
        let matrix_path = scratch.path().join(CONFUSION_MATRIX_FILE);
        tokio::fs::write(&matrix_path, matrix.to_csv())
            .await
            .with_context(|| format!("writing {}", matrix_path.display()))?;

        let artifact = model
            .to_artifact()
            .with_context(|| format!("serializing {name}"))?;
        self.tracker
            .log_model(run, &artifact, MODEL_ARTIFACT_PATH)
            .await
            .with_context(|| format!("logging model {name}"))?;

        let description = format!(
            "Model {} trained on {}",
            name,
            self.tracker.experiment_name()
        );
        self.tracker
            .set_tags(run, [("description", description.as_str())])
            .await?;

        let mut params = vec![
            ("classifier".to_string(), name.to_string()),
            ("random_seed".to_string(), self.settings.random_seed.to_string()),
        ];
        params.extend(model.params());
        self.tracker.log_params(run, params).await?;
        self.tracker
            .log_metrics(run, [("val_acc", val_accuracy)])
            .await?;

        self.tracker
            .log_artifacts(run, scratch.path(), None)
            .await
            .context("uploading artifacts")?;

        let registered = self
            .tracker
            .register_model(run, name, Some(&description), &self.settings.tags)
            .await
            .with_context(|| format!("registering {name}"))?;

        let deployment = match (self.deployer, &self.settings.deployment_name) {
            (Some(deployer), Some(deployment_name)) => Some(
                deployer
                    .deploy(&registered.source_uri, deployment_name, None, None, None)
                    .await
                    .with_context(|| format!("deploying {} as {}", registered.name, deployment_name))?,
            ),
            _ => None,
        };

        Ok(Trained {
            val_accuracy,
            registered,
            deployment,
        })
    }
}
