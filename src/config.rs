//! Pipeline configuration.
//!
//! One TOML file (`labflow.toml` by default) with a section per component.
//! Secrets and endpoints can be supplied through the environment instead of
//! the file; see [`LabConfig::apply_env`].

use crate::dataset::DatasetStore;
use crate::deploy::{DeployError, DeploymentClient, DeploymentConfig, HttpDeploymentTarget};
use crate::inference::InferenceClient;
use crate::store::{
    BucketConfig, BucketStore, ContainerConfig, ContainerCredential, ContainerStore,
    InMemoryObjectStore, LocalDirStore, ObjectStore, StoreError,
};
use crate::tracking::{ExperimentTracker, InMemoryTrackingBackend, MlflowBackend, TrackingError};
use crate::train::TrainingSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILENAME: &str = "labflow.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("missing setting `{0}`")]
    Missing(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("cannot build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

// ============================================================================
// Sections
// ============================================================================

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub storage: StorageConfig,
    pub tracking: TrackingConfig,
    pub training: TrainingConfig,
    pub deployment: DeploymentSection,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Bucket,
    Container,
    #[default]
    Local,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Bucket name (bucket backend) or directory name (local backend)
    pub bucket: String,
    pub region: String,
    /// Root directory of the local backend
    pub local_root: PathBuf,
    /// Storage account of the container backend
    pub account: Option<String>,
    pub container: Option<String>,
    /// Workspace datastore the container is registered as
    pub datastore: Option<String>,
    pub sas_token: Option<String>,
    /// Custom service endpoint (MinIO, Azurite)
    pub endpoint: Option<String>,
    /// Key prefix every split is stored under
    pub prefix: Option<String>,
    /// Local directory holding prepared `.npy` splits
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            bucket: "cancer-datasets".to_string(),
            region: "eu-north-1".to_string(),
            local_root: PathBuf::from(".labflow/store"),
            account: None,
            container: None,
            datastore: None,
            sas_token: None,
            endpoint: None,
            prefix: None,
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingKind {
    #[default]
    Mlflow,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub backend: TrackingKind,
    pub uri: String,
    pub experiment: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            backend: TrackingKind::Mlflow,
            uri: "http://localhost:5000".to_string(),
            experiment: "cancer_classification".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub run_name: String,
    pub random_seed: u64,
    pub artifact_dir: PathBuf,
    /// Built-in classifiers to train, in order
    pub classifiers: Vec<String>,
    pub deployment_name: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let settings = TrainingSettings::default();
        Self {
            run_name: settings.run_name,
            random_seed: settings.random_seed,
            artifact_dir: settings.artifact_dir,
            classifiers: vec!["majority_class".to_string(), "nearest_centroid".to_string()],
            deployment_name: settings.deployment_name,
            tags: settings.tags,
        }
    }
}

impl TrainingConfig {
    pub fn settings(&self) -> TrainingSettings {
        TrainingSettings {
            run_name: self.run_name.clone(),
            random_seed: self.random_seed,
            artifact_dir: self.artifact_dir.clone(),
            tags: self.tags.clone(),
            deployment_name: self.deployment_name.clone(),
        }
    }
}

/// Deployment service plus the per-deployment defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSection {
    /// Base URL of the deployment service; deployment is disabled when unset
    pub service_url: Option<String>,
    pub token: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub settings: DeploymentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub endpoint_url: Option<String>,
    pub api_key: Option<String>,
    pub deployment: Option<String>,
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            api_key: None,
            deployment: None,
            timeout_secs: 60,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl LabConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` when it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override settings from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Override settings from `lookup`; empty values are ignored
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(region) = var("AWS_REGION_NAME") {
            self.storage.region = region.clone();
            self.deployment.settings.region = region;
        }
        if let Some(account) = var("AZURE_STORAGE_ACCOUNT_NAME") {
            self.storage.account = Some(account);
        }
        if let Some(sas) = var("AZURE_STORAGE_SAS_TOKEN") {
            self.storage.sas_token = Some(sas);
        }
        if let Some(container) = var("AZURE_STORAGE_CONTAINER_NAME") {
            self.storage.container = Some(container);
        }
        if let Some(datastore) = var("AZURE_STORAGE_BLOB_DATASTORE_NAME") {
            self.storage.datastore = Some(datastore);
        }
        if let Some(prefix) = var("AZURE_STORAGE_TARGET_PATH") {
            self.storage.prefix = Some(prefix);
        }
        if let Some(uri) = var("MLFLOW_TRACKING_URI") {
            self.tracking.uri = uri;
        }
        if let Some(token) = var("MLFLOW_TRACKING_TOKEN") {
            self.tracking.token = Some(token);
        }
        if let Some(bucket) = var("LABFLOW_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Some(experiment) = var("LABFLOW_EXPERIMENT") {
            self.tracking.experiment = experiment;
        }
        if let Some(url) = var("LABFLOW_DEPLOYMENT_URL") {
            self.deployment.service_url = Some(url);
        }
        if let Some(token) = var("LABFLOW_DEPLOYMENT_TOKEN") {
            self.deployment.token = Some(token);
        }
        if let Some(role) = var("LABFLOW_EXECUTION_ROLE_ARN") {
            self.deployment.settings.execution_role_arn = role;
        }
        if let Some(url) = var("LABFLOW_INFERENCE_URL") {
            self.inference.endpoint_url = Some(url);
        }
        if let Some(key) = var("LABFLOW_INFERENCE_KEY") {
            self.inference.api_key = Some(key);
        }
    }

    // ========================================================================
    // Component builders
    // ========================================================================

    /// Object store for the configured backend
    pub async fn object_store(&self) -> Result<Arc<dyn ObjectStore>, ConfigError> {
        let s = &self.storage;
        let store: Arc<dyn ObjectStore> = match s.backend {
            StorageBackend::Memory => Arc::new(InMemoryObjectStore::new(&s.bucket)),
            StorageBackend::Local => Arc::new(LocalDirStore::new(&s.local_root, &s.bucket)),
            StorageBackend::Bucket => {
                let mut config = BucketConfig::new(&s.bucket, &s.region);
                if let Some(endpoint) = &s.endpoint {
                    config = config.with_endpoint(endpoint);
                }
                Arc::new(BucketStore::connect(config).await?)
            }
            StorageBackend::Container => {
                let account = s.account.as_ref().ok_or(ConfigError::Missing("storage.account"))?;
                let container = s
                    .container
                    .as_ref()
                    .ok_or(ConfigError::Missing("storage.container"))?;
                let mut config = ContainerConfig::new(account, container);
                if let Some(datastore) = &s.datastore {
                    config = config.with_datastore(datastore);
                }
                if let Some(endpoint) = &s.endpoint {
                    config = config.with_endpoint(endpoint);
                }
                if let Some(sas) = &s.sas_token {
                    config = config.with_credential(ContainerCredential::Sas(sas.clone()));
                }
                Arc::new(ContainerStore::new(config)?)
            }
        };
        debug!("Object store: {:?} {}", store.kind(), store.identifier());
        Ok(store)
    }

    pub async fn dataset_store(&self) -> Result<DatasetStore, ConfigError> {
        let dataset = DatasetStore::new(self.object_store().await?);
        Ok(match &self.storage.prefix {
            Some(prefix) => dataset.with_prefix(prefix),
            None => dataset,
        })
    }

    pub fn tracker(&self) -> Result<ExperimentTracker, ConfigError> {
        let t = &self.tracking;
        let tracker = match t.backend {
            TrackingKind::Memory => ExperimentTracker::new(
                Arc::new(InMemoryTrackingBackend::new()),
                &t.experiment,
            ),
            TrackingKind::Mlflow => {
                let mut backend = MlflowBackend::new(&t.uri, Duration::from_secs(t.timeout_secs))?;
                if let Some(token) = &t.token {
                    backend = backend.with_token(token);
                }
                ExperimentTracker::new(Arc::new(backend), &t.experiment)
            }
        };
        Ok(tracker)
    }

    /// Deployment client, or `None` when no deployment service is configured
    pub fn deployer(&self) -> Result<Option<DeploymentClient>, ConfigError> {
        let d = &self.deployment;
        let Some(url) = &d.service_url else {
            return Ok(None);
        };
        let timeout = Duration::from_secs(d.request_timeout_secs.unwrap_or(60));
        let mut target = HttpDeploymentTarget::new(url, timeout)?;
        if let Some(token) = &d.token {
            target = target.with_token(token);
        }
        Ok(Some(DeploymentClient::new(Arc::new(target), d.settings.clone())))
    }

    pub fn inference_client(&self) -> Result<InferenceClient, ConfigError> {
        Ok(InferenceClient::new(Duration::from_secs(
            self.inference.timeout_secs,
        ))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    // ============================================================================
    // DEFAULT VALUE TESTS
    // ============================================================================

    #[test]
    fn test_lab_config_default() {
        let config = LabConfig::default();

        assert_eq!(config.storage.backend, StorageBackend::Local);
        assert_eq!(config.storage.region, "eu-north-1");
        assert_eq!(config.tracking.backend, TrackingKind::Mlflow);
        assert_eq!(config.tracking.uri, "http://localhost:5000");
        assert_eq!(config.training.random_seed, 42);
        assert_eq!(config.training.run_name, "classifier_train");
        assert!(config.deployment.service_url.is_none());
        assert_eq!(config.deployment.settings.instance_type, "ml.m5.4xlarge");
    }

    #[test]
    fn test_training_settings_mirror_section() {
        let mut training = TrainingConfig {
            random_seed: 7,
            deployment_name: Some("ep".to_string()),
            ..Default::default()
        };
        training.tags.insert("team".to_string(), "lab".to_string());

        let settings = training.settings();
        assert_eq!(settings.random_seed, 7);
        assert_eq!(settings.deployment_name.as_deref(), Some("ep"));
        assert_eq!(settings.tags["team"], "lab");
    }

    // ============================================================================
    // FILE TESTS
    // ============================================================================

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);

        let mut config = LabConfig::default();
        config.storage.backend = StorageBackend::Container;
        config.storage.container = Some("datasets".to_string());
        config.training.tags.insert("owner".to_string(), "lab".to_string());
        config.deployment.service_url = Some("http://deployer:8080".to_string());
        config.save(&path).unwrap();

        let loaded = LabConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(
            &path,
            "[tracking]\nexperiment = \"breast_cancer\"\n\n[storage]\nbackend = \"memory\"\n",
        )
        .unwrap();

        let config = LabConfig::load(&path).unwrap();
        assert_eq!(config.tracking.experiment, "breast_cancer");
        assert_eq!(config.tracking.uri, "http://localhost:5000");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_load_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[storage\n").unwrap();

        let err = LabConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = LabConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, LabConfig::default());
    }

    // ============================================================================
    // ENVIRONMENT TESTS
    // ============================================================================

    #[test]
    fn test_apply_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AWS_REGION_NAME", "us-east-1"),
            ("AZURE_STORAGE_ACCOUNT_NAME", "labacct"),
            ("AZURE_STORAGE_SAS_TOKEN", "sv=2021&sig=abc"),
            ("AZURE_STORAGE_CONTAINER_NAME", "datasets"),
            ("AZURE_STORAGE_BLOB_DATASTORE_NAME", "workspaceblobstore"),
            ("AZURE_STORAGE_TARGET_PATH", "cancer/v1"),
            ("MLFLOW_TRACKING_URI", "http://mlflow:5000"),
            ("LABFLOW_EXPERIMENT", "exp"),
            ("LABFLOW_INFERENCE_KEY", "secret"),
            ("LABFLOW_EXECUTION_ROLE_ARN", "arn:aws:iam::1:role/deploy"),
        ]);
        let mut config = LabConfig::default();
        config.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.deployment.settings.region, "us-east-1");
        assert_eq!(config.storage.account.as_deref(), Some("labacct"));
        assert_eq!(config.storage.sas_token.as_deref(), Some("sv=2021&sig=abc"));
        assert_eq!(config.storage.container.as_deref(), Some("datasets"));
        assert_eq!(config.storage.datastore.as_deref(), Some("workspaceblobstore"));
        assert_eq!(config.storage.prefix.as_deref(), Some("cancer/v1"));
        assert_eq!(config.tracking.uri, "http://mlflow:5000");
        assert_eq!(config.tracking.experiment, "exp");
        assert_eq!(config.inference.api_key.as_deref(), Some("secret"));
        assert_eq!(
            config.deployment.settings.execution_role_arn,
            "arn:aws:iam::1:role/deploy"
        );
    }

    #[test]
    fn test_apply_env_ignores_empty_values() {
        let mut config = LabConfig::default();
        config.apply_env_from(|k| (k == "MLFLOW_TRACKING_URI").then(String::new));
        assert_eq!(config.tracking.uri, "http://localhost:5000");
    }

    // ============================================================================
    // BUILDER TESTS
    // ============================================================================

    #[tokio::test]
    async fn test_container_backend_requires_account() {
        let mut config = LabConfig::default();
        config.storage.backend = StorageBackend::Container;
        config.storage.container = Some("datasets".to_string());

        let Err(err) = config.object_store().await else {
            panic!("container backend without an account must be rejected");
        };
        assert!(matches!(err, ConfigError::Missing("storage.account")));
    }

    #[tokio::test]
    async fn test_dataset_store_applies_prefix() {
        let mut config = LabConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config.storage.prefix = Some("/cancer/".to_string());

        let dataset = config.dataset_store().await.unwrap();
        assert_eq!(dataset.prefix(), Some("cancer"));
    }

    #[test]
    fn test_deployer_disabled_without_service_url() {
        assert!(LabConfig::default().deployer().unwrap().is_none());

        let mut config = LabConfig::default();
        config.deployment.service_url = Some("http://deployer:8080".to_string());
        let deployer = config.deployer().unwrap().unwrap();
        assert_eq!(deployer.config().region, "eu-north-1");
    }

    #[test]
    fn test_memory_tracker() {
        let mut config = LabConfig::default();
        config.tracking.backend = TrackingKind::Memory;
        config.tracking.experiment = "exp".to_string();
        assert_eq!(config.tracker().unwrap().experiment_name(), "exp");
    }
}
