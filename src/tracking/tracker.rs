//! Run state machine over a [`TrackingBackend`].

use super::backend::{LogBatch, ModelRegistration, TrackingBackend};
use super::{
    canonical_model_name, model_source_uri, ModelArtifact, RegisteredModel, RunHandle, RunSpec,
    RunStatus, TrackingError, MODEL_DESCRIPTOR_FILE, MODEL_PAYLOAD_FILE, PARENT_RUN_TAG,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug)]
struct RunState {
    handle: RunHandle,
    status: RunStatus,
    open_children: BTreeSet<String>,
    /// Artifact path of the last model logged to this run
    model_path: Option<String>,
}

/// `MLmodel` descriptor
#[derive(Debug, Serialize)]
struct ModelDescriptor<'a> {
    artifact_path: &'a str,
    run_id: &'a str,
    utc_time_created: String,
    flavors: BTreeMap<&'a str, serde_json::Value>,
}

/// Creates runs, logs to them and closes them in a well-nested order.
///
/// Every operation takes the [`RunHandle`] it applies to. Runs move
/// `Running -> Finished | Failed` exactly once; logging to a closed run is
/// refused with [`TrackingError::RunNotActive`].
pub struct ExperimentTracker {
    backend: Arc<dyn TrackingBackend>,
    experiment_name: String,
    experiment_id: OnceCell<String>,
    runs: Mutex<HashMap<String, RunState>>,
}

impl std::fmt::Debug for ExperimentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentTracker")
            .field("experiment_name", &self.experiment_name)
            .field("experiment_id", &self.experiment_id.get())
            .finish_non_exhaustive()
    }
}

impl ExperimentTracker {
    pub fn new(backend: Arc<dyn TrackingBackend>, experiment_name: impl Into<String>) -> Self {
        Self {
            backend,
            experiment_name: experiment_name.into(),
            experiment_id: OnceCell::new(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    /// Current status of a run started by this tracker
    pub fn status(&self, run: &RunHandle) -> Option<RunStatus> {
        self.lock().get(&run.run_id).map(|s| s.status)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunState>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_running(&self, run: &RunHandle) -> Result<(), TrackingError> {
        match self.lock().get(&run.run_id) {
            Some(state) if state.status == RunStatus::Running => Ok(()),
            _ => Err(TrackingError::RunNotActive {
                run_id: run.run_id.clone(),
            }),
        }
    }

    async fn experiment_id(&self) -> Result<&str, TrackingError> {
        let id = self
            .experiment_id
            .get_or_try_init(|| self.backend.ensure_experiment(&self.experiment_name))
            .await?;
        Ok(id.as_str())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a run, nested under `spec.parent` when given
    pub async fn start_run(&self, spec: RunSpec) -> Result<RunHandle, TrackingError> {
        let mut tags = spec.tags;
        if let Some(parent) = &spec.parent {
            match self.lock().get(&parent.run_id) {
                Some(state) if state.status == RunStatus::Running => {}
                _ => {
                    return Err(TrackingError::ParentNotActive {
                        run_id: parent.run_id.clone(),
                    })
                }
            }
            tags.insert(PARENT_RUN_TAG.to_string(), parent.run_id.clone());
        }

        let experiment_id = self.experiment_id().await?.to_string();
        let created = self
            .backend
            .create_run(&experiment_id, &spec.name, &tags)
            .await?;

        let handle = RunHandle {
            run_id: created.run_id,
            experiment_id,
            name: spec.name,
            parent_run_id: spec.parent.as_ref().map(|p| p.run_id.clone()),
            artifact_uri: created.artifact_uri,
        };

        let mut runs = self.lock();
        if let Some(parent_id) = &handle.parent_run_id {
            if let Some(parent) = runs.get_mut(parent_id) {
                parent.open_children.insert(handle.run_id.clone());
            }
        }
        runs.insert(
            handle.run_id.clone(),
            RunState {
                handle: handle.clone(),
                status: RunStatus::Running,
                open_children: BTreeSet::new(),
                model_path: None,
            },
        );
        info!(
            "Started run {} ({}){}",
            handle.name,
            handle.run_id,
            handle
                .parent_run_id
                .as_ref()
                .map(|p| format!(" under {p}"))
                .unwrap_or_default()
        );
        Ok(handle)
    }

    /// Close a run.
    ///
    /// Refused with [`TrackingError::OpenChildRuns`] while any child is still
    /// running; the run stays open in that case. `Running` is treated as
    /// `Finished`.
    ///
    /// A backend failure is returned, but the run is still closed locally
    /// and detached from its parent so the parent can close.
    pub async fn end_run(&self, run: &RunHandle, status: RunStatus) -> Result<(), TrackingError> {
        let status = if status.is_terminal() {
            status
        } else {
            RunStatus::Finished
        };

        {
            let runs = self.lock();
            let state = runs
                .get(&run.run_id)
                .filter(|s| s.status == RunStatus::Running)
                .ok_or_else(|| TrackingError::RunNotActive {
                    run_id: run.run_id.clone(),
                })?;
            if !state.open_children.is_empty() {
                return Err(TrackingError::OpenChildRuns {
                    run_id: run.run_id.clone(),
                    children: state.open_children.iter().cloned().collect(),
                });
            }
        }

        let updated = self.backend.update_run(&run.run_id, status).await;

        let mut runs = self.lock();
        if let Some(state) = runs.get_mut(&run.run_id) {
            state.status = status;
        }
        if let Some(parent_id) = &run.parent_run_id {
            if let Some(parent) = runs.get_mut(parent_id) {
                parent.open_children.remove(&run.run_id);
            }
        }
        drop(runs);

        match updated {
            Ok(()) => {
                info!("Run {} ({}) {}", run.name, run.run_id, status);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Run {} ({}) closed locally as {} but the backend update failed: {}",
                    run.name, run.run_id, status, e
                );
                Err(e)
            }
        }
    }

    /// Close `run` as `Failed`, closing its open descendants first.
    ///
    /// No-op for a run that is already closed. Every close is attempted; the
    /// first error is returned.
    pub async fn abort_run(&self, run: &RunHandle) -> Result<(), TrackingError> {
        // Breadth-first, then reversed: every run comes after its children.
        let mut order = Vec::new();
        {
            let runs = self.lock();
            match runs.get(&run.run_id) {
                Some(state) if state.status == RunStatus::Running => {}
                _ => return Ok(()),
            }
            let mut next = 0;
            order.push(run.clone());
            while next < order.len() {
                let children: Vec<RunHandle> = runs
                    .get(&order[next].run_id)
                    .map(|s| {
                        s.open_children
                            .iter()
                            .filter_map(|id| runs.get(id).map(|c| c.handle.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                order.extend(children);
                next += 1;
            }
        }

        let mut first_err = None;
        for handle in order.iter().rev() {
            if let Err(e) = self.end_run(handle, RunStatus::Failed).await {
                warn!("Could not close run {}: {}", handle.run_id, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Run `body` inside a fresh run.
    ///
    /// The run ends `Finished` when `body` returns `Ok` and `Failed`
    /// otherwise. Children the body left open are closed `Failed` with it.
    pub async fn in_run<T, E, F, Fut>(&self, spec: RunSpec, body: F) -> Result<T, E>
    where
        F: FnOnce(RunHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TrackingError>,
    {
        let run = self.start_run(spec).await?;
        match body(run.clone()).await {
            Ok(value) => match self.end_run(&run, RunStatus::Finished).await {
                Ok(()) => Ok(value),
                Err(e) => {
                    if let Err(close_err) = self.abort_run(&run).await {
                        warn!("Could not close run {}: {}", run.run_id, close_err);
                    }
                    Err(e.into())
                }
            },
            Err(e) => {
                if let Err(close_err) = self.abort_run(&run).await {
                    warn!("Could not close failed run {}: {}", run.run_id, close_err);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Logging
    // ========================================================================

    pub async fn log_params<K, V>(
        &self,
        run: &RunHandle,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), TrackingError>
    where
        K: Into<String>,
        V: ToString,
    {
        let batch = LogBatch {
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        self.log_batch(run, batch).await
    }

    pub async fn log_metrics<K>(
        &self,
        run: &RunHandle,
        metrics: impl IntoIterator<Item = (K, f64)>,
    ) -> Result<(), TrackingError>
    where
        K: Into<String>,
    {
        let batch = LogBatch {
            metrics: metrics.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            ..Default::default()
        };
        self.log_batch(run, batch).await
    }

    pub async fn set_tags<K, V>(
        &self,
        run: &RunHandle,
        tags: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), TrackingError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let batch = LogBatch {
            tags: tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            ..Default::default()
        };
        self.log_batch(run, batch).await
    }

    async fn log_batch(&self, run: &RunHandle, batch: LogBatch) -> Result<(), TrackingError> {
        self.ensure_running(run)?;
        debug!(
            "log to {}: {} params, {} metrics, {} tags",
            run.run_id,
            batch.params.len(),
            batch.metrics.len(),
            batch.tags.len()
        );
        self.backend.log_batch(&run.run_id, batch).await
    }

    // ========================================================================
    // Artifacts and models
    // ========================================================================

    /// Upload every file under `dir`, keeping paths relative to `dir`.
    ///
    /// Returns the artifact paths written.
    pub async fn log_artifacts(
        &self,
        run: &RunHandle,
        dir: &Path,
        artifact_path: Option<&str>,
    ) -> Result<Vec<String>, TrackingError> {
        self.ensure_running(run)?;
        let mut written = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| TrackingError::Artifact {
                path: dir.to_path_buf(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let target = match artifact_path {
                Some(prefix) if !prefix.is_empty() => {
                    format!("{}/{}", prefix.trim_matches('/'), relative)
                }
                _ => relative,
            };
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|source| TrackingError::Artifact {
                    path: entry.path().to_path_buf(),
                    source,
                })?;
            self.backend.upload_artifact(run, &target, bytes).await?;
            written.push(target);
        }
        debug!("uploaded {} artifacts to {}", written.len(), run.run_id);
        Ok(written)
    }

    /// Serialize `model` under `artifact_path` and remember it for
    /// [`register_model`](Self::register_model).
    pub async fn log_model(
        &self,
        run: &RunHandle,
        model: &ModelArtifact,
        artifact_path: &str,
    ) -> Result<(), TrackingError> {
        self.ensure_running(run)?;
        let artifact_path = artifact_path.trim_matches('/');

        let mut flavors = BTreeMap::new();
        flavors.insert(
            model.flavor.as_str(),
            serde_json::json!({ "loader_module": "labflow", "data": MODEL_PAYLOAD_FILE }),
        );
        flavors.insert(
            "labflow",
            serde_json::json!({ "classifier": model.classifier, "data": MODEL_PAYLOAD_FILE }),
        );
        let descriptor = ModelDescriptor {
            artifact_path,
            run_id: &run.run_id,
            utc_time_created: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            flavors,
        };

        // Removed on drop, including on the error paths below.
        let staging = tempfile::tempdir().map_err(|source| TrackingError::Artifact {
            path: std::env::temp_dir(),
            source,
        })?;
        let write = |name: &str, contents: String| {
            let path = staging.path().join(name);
            std::fs::write(&path, contents).map_err(|source| TrackingError::Artifact { path, source })
        };
        write(MODEL_DESCRIPTOR_FILE, serde_yaml::to_string(&descriptor)?)?;
        write(MODEL_PAYLOAD_FILE, serde_json::to_string_pretty(model)?)?;

        self.log_artifacts(run, staging.path(), Some(artifact_path))
            .await?;

        if let Some(state) = self.lock().get_mut(&run.run_id) {
            state.model_path = Some(artifact_path.to_string());
        }
        info!("Logged {} model to {}/{}", model.classifier, run.run_id, artifact_path);
        Ok(())
    }

    /// Register the run's logged model.
    ///
    /// The registry name is `display_name` with whitespace runs replaced by
    /// `_`. `description` is also stored as a `description` tag.
    pub async fn register_model(
        &self,
        run: &RunHandle,
        display_name: &str,
        description: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> Result<RegisteredModel, TrackingError> {
        let model_path = self
            .lock()
            .get(&run.run_id)
            .filter(|s| s.status == RunStatus::Running)
            .and_then(|s| s.model_path.clone())
            .ok_or_else(|| TrackingError::NoActiveModelArtifact {
                run_id: run.run_id.clone(),
            })?;

        let mut tags = tags.clone();
        if let Some(description) = description {
            tags.insert("description".to_string(), description.to_string());
        }
        let registration = ModelRegistration {
            name: canonical_model_name(display_name),
            source_uri: model_source_uri(&run.run_id, &model_path),
            run_id: run.run_id.clone(),
            description: description.map(str::to_string),
            tags,
        };
        let model = self.backend.register_model(&registration).await?;
        info!(
            "Registered {} version {} from {}",
            model.name, model.version, model.source_uri
        );
        Ok(model)
    }

    /// Handles of runs that are still open
    pub fn open_runs(&self) -> Vec<RunHandle> {
        let mut open: Vec<RunHandle> = self
            .lock()
            .values()
            .filter(|s| s.status == RunStatus::Running)
            .map(|s| s.handle.clone())
            .collect();
        open.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        open
    }
}
