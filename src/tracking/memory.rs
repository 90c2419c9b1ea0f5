//! In-memory tracking backend for tests and dry runs.

use super::backend::{CreatedRun, LogBatch, ModelRegistration, TrackingBackend};
use super::{RegisteredModel, RunHandle, RunStatus, TrackingError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One call seen by the backend
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingCall {
    EnsureExperiment(String),
    CreateRun(String),
    LogBatch(String),
    UploadArtifact(String),
    UpdateRun(String, RunStatus),
    RegisterModel(String),
}

/// Everything recorded for one run
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    pub run_id: String,
    pub experiment_id: String,
    pub name: String,
    pub status: RunStatus,
    pub tags: BTreeMap<String, String>,
    pub params: Vec<(String, String)>,
    pub metrics: Vec<(String, f64)>,
    pub artifacts: BTreeMap<String, Vec<u8>>,
}

impl RecordedRun {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }
}

#[derive(Debug, Default)]
struct State {
    experiments: BTreeMap<String, String>,
    runs: Vec<RecordedRun>,
    registry: BTreeMap<String, Vec<RegisteredModel>>,
    calls: Vec<TrackingCall>,
    failures: Vec<(&'static str, String)>,
}

impl State {
    fn run_mut(&mut self, run_id: &str) -> Result<&mut RecordedRun, TrackingError> {
        self.runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| TrackingError::backend("lookup", format!("unknown run {run_id}")))
    }

    fn check(&self, operation: &'static str, subject: &str) -> Result<(), TrackingError> {
        if self
            .failures
            .iter()
            .any(|(op, s)| *op == operation && s == subject)
        {
            return Err(TrackingError::backend(
                operation,
                format!("injected failure for {subject}"),
            ));
        }
        Ok(())
    }
}

/// Tracking backend that keeps runs and registry versions in memory
#[derive(Debug, Default)]
pub struct InMemoryTrackingBackend {
    state: RwLock<State>,
}

impl InMemoryTrackingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `operation` call whose subject equals `subject`.
    ///
    /// Subjects: experiment name, run name, run id, artifact path or model
    /// name, depending on the operation.
    pub fn fail_on(&self, operation: &'static str, subject: impl Into<String>) {
        if let Ok(mut state) = self.write() {
            state.failures.push((operation, subject.into()));
        }
    }

    pub fn calls(&self) -> Vec<TrackingCall> {
        self.read().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Runs in creation order
    pub fn runs(&self) -> Vec<RecordedRun> {
        self.read().map(|s| s.runs.clone()).unwrap_or_default()
    }

    pub fn run(&self, run_id: &str) -> Option<RecordedRun> {
        self.read()
            .ok()?
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
    }

    pub fn run_named(&self, name: &str) -> Option<RecordedRun> {
        self.read()
            .ok()?
            .runs
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    /// Registered versions of `name`, oldest first
    pub fn versions(&self, name: &str) -> Vec<RegisteredModel> {
        self.read()
            .ok()
            .and_then(|s| s.registry.get(name).cloned())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, TrackingError> {
        self.state
            .read()
            .map_err(|e| TrackingError::backend("lock", format!("Lock error: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, TrackingError> {
        self.state
            .write()
            .map_err(|e| TrackingError::backend("lock", format!("Lock error: {}", e)))
    }
}

#[async_trait]
impl TrackingBackend for InMemoryTrackingBackend {
    async fn ensure_experiment(&self, name: &str) -> Result<String, TrackingError> {
        let mut state = self.write()?;
        state
            .calls
            .push(TrackingCall::EnsureExperiment(name.to_string()));
        state.check("ensure_experiment", name)?;
        let next_id = state.experiments.len().to_string();
        Ok(state
            .experiments
            .entry(name.to_string())
            .or_insert(next_id)
            .clone())
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<CreatedRun, TrackingError> {
        let mut state = self.write()?;
        state.calls.push(TrackingCall::CreateRun(name.to_string()));
        state.check("create_run", name)?;

        let run_id = format!("run-{:04}", state.runs.len() + 1);
        let artifact_uri = format!("memory://{experiment_id}/{run_id}/artifacts");
        state.runs.push(RecordedRun {
            run_id: run_id.clone(),
            experiment_id: experiment_id.to_string(),
            name: name.to_string(),
            status: RunStatus::Running,
            tags: tags.clone(),
            params: Vec::new(),
            metrics: Vec::new(),
            artifacts: BTreeMap::new(),
        });
        Ok(CreatedRun {
            run_id,
            artifact_uri,
        })
    }

    async fn log_batch(&self, run_id: &str, batch: LogBatch) -> Result<(), TrackingError> {
        let mut state = self.write()?;
        state.calls.push(TrackingCall::LogBatch(run_id.to_string()));
        state.check("log_batch", run_id)?;

        let run = state.run_mut(run_id)?;
        run.params.extend(batch.params);
        run.metrics.extend(batch.metrics);
        run.tags.extend(batch.tags);
        Ok(())
    }

    async fn upload_artifact(
        &self,
        run: &RunHandle,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TrackingError> {
        let mut state = self.write()?;
        state
            .calls
            .push(TrackingCall::UploadArtifact(path.to_string()));
        state.check("upload_artifact", path)?;
        state
            .run_mut(&run.run_id)?
            .artifacts
            .insert(path.to_string(), bytes);
        Ok(())
    }

    async fn update_run(&self, run_id: &str, status: RunStatus) -> Result<(), TrackingError> {
        let mut state = self.write()?;
        state
            .calls
            .push(TrackingCall::UpdateRun(run_id.to_string(), status));
        state.check("update_run", run_id)?;
        state.run_mut(run_id)?.status = status;
        Ok(())
    }

    async fn register_model(
        &self,
        registration: &ModelRegistration,
    ) -> Result<RegisteredModel, TrackingError> {
        let mut state = self.write()?;
        state
            .calls
            .push(TrackingCall::RegisterModel(registration.name.clone()));
        state.check("register_model", &registration.name)?;

        let versions = state
            .registry
            .entry(registration.name.clone())
            .or_default();
        let model = RegisteredModel {
            name: registration.name.clone(),
            version: versions.len() as u64 + 1,
            source_uri: registration.source_uri.clone(),
            run_id: registration.run_id.clone(),
            description: registration.description.clone(),
            tags: registration.tags.clone(),
        };
        versions.push(model.clone());
        Ok(model)
    }
}
