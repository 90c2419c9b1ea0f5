//! Orchestrator tests: batch resilience, run nesting, fail-fast dataset load.

use super::*;
use crate::deploy::{DeployCall, DeploymentConfig, InMemoryDeploymentTarget};
use crate::store::InMemoryObjectStore;
use crate::tracking::{InMemoryTrackingBackend, TrackingCall, PARENT_RUN_TAG};
use ndarray::{arr1, arr2};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Classifier whose `fit` always fails
struct Broken;

impl Classifier for Broken {
    fn kind(&self) -> &'static str {
        "broken"
    }

    fn fit(&mut self, _x: &Array2<f64>, _y: &Array1<i64>) -> Result<(), ModelError> {
        Err(ModelError::Other("solver did not converge".to_string()))
    }

    fn predict(&self, _x: &Array2<f64>) -> Result<Array1<i64>, ModelError> {
        Err(ModelError::NotFitted)
    }

    fn params(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn to_artifact(&self) -> Result<ModelArtifact, ModelError> {
        Err(ModelError::NotFitted)
    }
}

/// Classifier that answers every query with a single prediction
struct OneAnswer;

impl Classifier for OneAnswer {
    fn kind(&self) -> &'static str {
        "one_answer"
    }

    fn fit(&mut self, _x: &Array2<f64>, _y: &Array1<i64>) -> Result<(), ModelError> {
        Ok(())
    }

    fn predict(&self, _x: &Array2<f64>) -> Result<Array1<i64>, ModelError> {
        Ok(arr1(&[0]))
    }

    fn params(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn to_artifact(&self) -> Result<ModelArtifact, ModelError> {
        Ok(ModelArtifact::new("one_answer", serde_json::json!({})))
    }
}

fn splits() -> DatasetSplits {
    DatasetSplits {
        x_train: arr2(&[[0.0, 0.0], [0.1, 0.2], [5.0, 5.0], [5.1, 4.9]]),
        x_val: arr2(&[[0.2, 0.1], [4.8, 5.2]]),
        x_test: arr2(&[[0.0, 0.3], [5.3, 5.0]]),
        y_train: arr1(&[0, 0, 1, 1]),
        y_val: arr1(&[0, 1]),
        y_test: arr1(&[0, 1]),
    }
}

struct Fixture {
    _artifacts: TempDir,
    dataset: DatasetStore,
    backend: Arc<InMemoryTrackingBackend>,
    tracker: ExperimentTracker,
    settings: TrainingSettings,
}

async fn fixture(upload: bool) -> Fixture {
    let store = Arc::new(InMemoryObjectStore::new("datasets"));
    let dataset = DatasetStore::new(store);
    if upload {
        for (key, result) in dataset.upload_splits(&splits()).await {
            result.unwrap_or_else(|e| panic!("{key}: {e}"));
        }
    }
    let backend = Arc::new(InMemoryTrackingBackend::new());
    let tracker = ExperimentTracker::new(backend.clone(), "cancer");
    let artifacts = TempDir::new().unwrap();
    let settings = TrainingSettings {
        artifact_dir: artifacts.path().join("artifacts"),
        tags: BTreeMap::from([("team".to_string(), "lab".to_string())]),
        ..Default::default()
    };
    Fixture {
        _artifacts: artifacts,
        dataset,
        backend,
        tracker,
        settings,
    }
}

fn three_models() -> IndexMap<String, Box<dyn Classifier>> {
    let mut models: IndexMap<String, Box<dyn Classifier>> = IndexMap::new();
    models.insert("A".to_string(), Box::new(NearestCentroid::new()));
    models.insert("B".to_string(), Box::new(Broken));
    models.insert("C".to_string(), Box::new(MajorityClass::new()));
    models
}

#[tokio::test]
async fn test_batch_continues_past_failed_model() {
    let f = fixture(true).await;
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());

    let report = orchestrator.run(three_models()).await.unwrap();

    let statuses: Vec<(&str, RunStatus)> = report
        .outcomes
        .iter()
        .map(|o| (o.model.as_str(), o.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("A", RunStatus::Finished),
            ("B", RunStatus::Failed),
            ("C", RunStatus::Finished)
        ]
    );
    assert_eq!(report.parent_status, RunStatus::Finished);
    assert_eq!(report.succeeded(), 2);

    let b = report.outcome("B").unwrap();
    assert!(b.error.as_deref().unwrap().contains("solver did not converge"));
    assert!(b.registered.is_none());

    let a = report.outcome("A").unwrap();
    assert_eq!(a.val_accuracy, Some(1.0));
    assert_eq!(a.registered.as_ref().unwrap().name, "A");
    assert_eq!(report.best().unwrap().model, "A");
}

#[tokio::test]
async fn test_children_nested_under_closed_parent() {
    let f = fixture(true).await;
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());
    let report = orchestrator.run(three_models()).await.unwrap();

    let parent = f.backend.run(&report.parent_run_id).unwrap();
    assert_eq!(parent.status, RunStatus::Finished);
    assert_eq!(parent.param("random_seed"), Some("42"));
    assert_eq!(parent.tags.get("team").map(String::as_str), Some("lab"));

    for name in ["A", "B", "C"] {
        let child = f.backend.run_named(name).unwrap();
        assert_eq!(child.tags.get(PARENT_RUN_TAG), Some(&report.parent_run_id));
        assert!(child.status.is_terminal());
    }
    assert!(f.tracker.open_runs().is_empty());

    // The parent is closed after every child.
    let calls = f.backend.calls();
    let last_update = calls
        .iter()
        .rev()
        .find(|c| matches!(c, TrackingCall::UpdateRun(..)))
        .unwrap();
    assert_eq!(
        *last_update,
        TrackingCall::UpdateRun(report.parent_run_id.clone(), RunStatus::Finished)
    );
}

#[tokio::test]
async fn test_successful_child_logs_everything() {
    let f = fixture(true).await;
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());
    orchestrator.run(three_models()).await.unwrap();

    let a = f.backend.run_named("A").unwrap();
    assert_eq!(a.param("classifier"), Some("A"));
    assert_eq!(a.param("random_seed"), Some("42"));
    assert_eq!(a.param("metric"), Some("euclidean"));
    assert_eq!(a.metric("val_acc"), Some(1.0));
    assert_eq!(
        a.tags.get("description").map(String::as_str),
        Some("Model A trained on cancer")
    );
    assert!(a.artifacts.contains_key("model/MLmodel"));
    assert!(a.artifacts.contains_key(CONFUSION_MATRIX_FILE));
    assert_eq!(f.backend.versions("A").len(), 1);
}

#[tokio::test]
async fn test_every_model_failing_fails_parent() {
    let f = fixture(true).await;
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());

    let mut models: IndexMap<String, Box<dyn Classifier>> = IndexMap::new();
    models.insert("B1".to_string(), Box::new(Broken));
    models.insert("B2".to_string(), Box::new(Broken));
    let report = orchestrator.run(models).await.unwrap();

    assert_eq!(report.failed(), 2);
    assert_eq!(report.parent_status, RunStatus::Failed);
    assert_eq!(
        f.backend.run(&report.parent_run_id).unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn test_registration_failure_is_per_model() {
    let f = fixture(true).await;
    f.backend.fail_on("register_model", "C");
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());

    let report = orchestrator.run(three_models()).await.unwrap();
    let c = report.outcome("C").unwrap();
    assert_eq!(c.status, RunStatus::Failed);
    assert!(c.error.as_deref().unwrap().contains("registering C"));
    assert_eq!(report.outcome("A").unwrap().status, RunStatus::Finished);
}

#[tokio::test]
async fn test_missing_split_fails_before_any_run() {
    let f = fixture(false).await;
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());

    let err = orchestrator.run(three_models()).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Dataset(DatasetError::SplitNotFound { .. })
    ));
    assert!(f.backend.runs().is_empty());
}

#[tokio::test]
async fn test_empty_model_set_rejected() {
    let f = fixture(true).await;
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());
    let err = orchestrator.run(IndexMap::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[tokio::test]
async fn test_deploys_each_registered_model_under_one_name() {
    let f = fixture(true).await;
    let target = Arc::new(InMemoryDeploymentTarget::new());
    let deployer = DeploymentClient::new(
        target.clone(),
        DeploymentConfig::new("serving:latest")
            .with_timeout(2)
            .with_poll_interval(Duration::from_millis(5)),
    );
    let settings = TrainingSettings {
        deployment_name: Some("cancer-endpoint".to_string()),
        ..f.settings.clone()
    };
    let orchestrator =
        TrainingOrchestrator::new(&f.dataset, &f.tracker, settings).with_deployer(&deployer);

    let report = orchestrator.run(three_models()).await.unwrap();

    // A and C deploy; the second replaces the first.
    assert_eq!(
        target.mutations(),
        vec![
            DeployCall::Create("cancer-endpoint".into()),
            DeployCall::Delete("cancer-endpoint".into()),
            DeployCall::Create("cancer-endpoint".into()),
        ]
    );
    let live = target.deployment("cancer-endpoint").unwrap();
    let c = report.outcome("C").unwrap();
    assert_eq!(live.model_uri, c.registered.as_ref().unwrap().source_uri);
    assert!(c.deployment.is_some());
}

#[tokio::test]
async fn test_deployer_without_name_rejected() {
    let f = fixture(true).await;
    let deployer = DeploymentClient::new(
        Arc::new(InMemoryDeploymentTarget::new()),
        DeploymentConfig::default(),
    );
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone())
        .with_deployer(&deployer);
    let err = orchestrator.run(three_models()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

// Run ids from a fresh in-memory backend: parent run-0001, then A run-0002,
// B run-0003, C run-0004.

#[tokio::test]
async fn test_parent_closed_when_batch_errors() {
    let f = fixture(true).await;
    f.backend.fail_on("log_batch", "run-0001");
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());

    let err = orchestrator.run(three_models()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Tracking(_)));
    assert!(f.tracker.open_runs().is_empty());
    assert_eq!(f.backend.run("run-0001").unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_child_close_failure_is_per_model() {
    let f = fixture(true).await;
    f.backend.fail_on("update_run", "run-0004");
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());

    let report = orchestrator.run(three_models()).await.unwrap();

    let c = report.outcome("C").unwrap();
    assert_eq!(c.run_id.as_deref(), Some("run-0004"));
    assert_eq!(c.status, RunStatus::Failed);
    assert!(c.error.as_deref().unwrap().contains("update_run"));
    assert_eq!(report.outcome("A").unwrap().status, RunStatus::Finished);
    assert_eq!(report.parent_status, RunStatus::Finished);
    assert_eq!(
        f.backend.run(&report.parent_run_id).unwrap().status,
        RunStatus::Finished
    );
    assert!(f.tracker.open_runs().is_empty());
}

#[tokio::test]
async fn test_stale_artifact_files_not_uploaded() {
    let f = fixture(true).await;
    std::fs::create_dir_all(&f.settings.artifact_dir).unwrap();
    std::fs::write(f.settings.artifact_dir.join("stale.csv"), "old\n").unwrap();
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());

    orchestrator.run(three_models()).await.unwrap();

    for name in ["A", "C"] {
        let run = f.backend.run_named(name).unwrap();
        assert!(run.artifacts.contains_key(CONFUSION_MATRIX_FILE), "{name}");
        assert!(!run.artifacts.keys().any(|k| k.contains("stale")), "{name}");
    }
    // Scratch directories are gone; only the pre-existing file remains.
    let left: Vec<_> = std::fs::read_dir(&f.settings.artifact_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(left, vec![std::ffi::OsString::from("stale.csv")]);
}

#[tokio::test]
async fn test_wrong_prediction_count_fails_model() {
    let f = fixture(true).await;
    let orchestrator = TrainingOrchestrator::new(&f.dataset, &f.tracker, f.settings.clone());

    let mut models: IndexMap<String, Box<dyn Classifier>> = IndexMap::new();
    models.insert("short".to_string(), Box::new(OneAnswer));
    models.insert("A".to_string(), Box::new(NearestCentroid::new()));
    let report = orchestrator.run(models).await.unwrap();

    let short = report.outcome("short").unwrap();
    assert_eq!(short.status, RunStatus::Failed);
    assert_eq!(short.val_accuracy, None);
    assert!(short
        .error
        .as_deref()
        .unwrap()
        .contains("1 predictions for 2 validation rows"));
    assert_eq!(report.outcome("A").unwrap().status, RunStatus::Finished);
}
