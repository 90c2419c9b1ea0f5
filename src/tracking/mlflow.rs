//! MLflow tracking server backend (REST API 2.0).
//!
//! Artifacts are uploaded through the server's `mlflow-artifacts` proxy, so
//! runs must have an `mlflow-artifacts:` artifact root (the default when the
//! server runs with `--serve-artifacts`).

use super::backend::{CreatedRun, LogBatch, ModelRegistration, TrackingBackend};
use super::{RegisteredModel, RunHandle, RunStatus, TrackingError};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const API_PREFIX: &str = "api/2.0/mlflow";
const ARTIFACT_PREFIX: &str = "api/2.0/mlflow-artifacts/artifacts";

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentInfo,
}

#[derive(Debug, Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    run: RunBody,
}

#[derive(Debug, Deserialize)]
struct RunBody {
    info: RunInfo,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
    artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct ModelVersionEnvelope {
    model_version: ModelVersion,
}

#[derive(Debug, Deserialize)]
struct ModelVersion {
    version: String,
}

/// Failed call: HTTP status plus the server's error code, if any
#[derive(Debug)]
struct CallFailure {
    status: Option<StatusCode>,
    error_code: String,
    message: String,
}

impl CallFailure {
    fn into_error(self, operation: &'static str) -> TrackingError {
        let status = self
            .status
            .map(|s| format!("HTTP {s} "))
            .unwrap_or_default();
        TrackingError::backend(
            operation,
            format!("{status}{} {}", self.error_code, self.message)
                .trim()
                .to_string(),
        )
    }
}

/// `key`/`value` pairs as the API expects them
fn key_values<'a>(pairs: impl IntoIterator<Item = (&'a String, &'a String)>) -> Vec<Value> {
    pairs
        .into_iter()
        .map(|(k, v)| json!({ "key": k, "value": v }))
        .collect()
}

/// Path under the artifact proxy for an `mlflow-artifacts:` root
pub(crate) fn artifact_proxy_path(artifact_uri: &str) -> Option<String> {
    let rest = artifact_uri.strip_prefix("mlflow-artifacts:")?;
    let rest = match rest.strip_prefix("//") {
        // mlflow-artifacts://host:port/path
        Some(with_host) => with_host.split_once('/').map(|(_, p)| p)?,
        None => rest,
    };
    Some(rest.trim_matches('/').to_string())
}

/// Client for one MLflow tracking server
#[derive(Debug, Clone)]
pub struct MlflowBackend {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl MlflowBackend {
    pub fn new(tracking_uri: impl Into<String>, timeout: Duration) -> Result<Self, TrackingError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("labflow/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| TrackingError::backend("connect", e))?;
        Ok(Self {
            base_url: tracking_uri.into().trim_end_matches('/').to_string(),
            client,
            token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_PREFIX, endpoint)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send + status check + JSON parse
    async fn call<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, CallFailure> {
        let response = builder.send().await.map_err(|e| CallFailure {
            status: None,
            error_code: String::new(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: Option<ApiError> = serde_json::from_str(&body).ok();
            return Err(match parsed {
                Some(api) => CallFailure {
                    status: Some(status),
                    error_code: api.error_code,
                    message: api.message,
                },
                None => CallFailure {
                    status: Some(status),
                    error_code: String::new(),
                    message: body,
                },
            });
        }

        response.json().await.map_err(|e| CallFailure {
            status: Some(status),
            error_code: String::new(),
            message: format!("invalid response body: {e}"),
        })
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> Result<T, CallFailure> {
        let url = self.api_url(endpoint);
        debug!("POST {}", url);
        self.call(self.request(Method::POST, &url).json(&body)).await
    }
}

#[async_trait]
impl TrackingBackend for MlflowBackend {
    async fn ensure_experiment(&self, name: &str) -> Result<String, TrackingError> {
        let url = self.api_url("experiments/get-by-name");
        let lookup: Result<ExperimentEnvelope, CallFailure> = self
            .call(
                self.request(Method::GET, &url)
                    .query(&[("experiment_name", name)]),
            )
            .await;

        match lookup {
            Ok(found) => Ok(found.experiment.experiment_id),
            Err(failure)
                if failure.status == Some(StatusCode::NOT_FOUND)
                    || failure.error_code == "RESOURCE_DOES_NOT_EXIST" =>
            {
                debug!("creating experiment {}", name);
                let created: CreateExperimentResponse = self
                    .post("experiments/create", json!({ "name": name }))
                    .await
                    .map_err(|f| f.into_error("create_experiment"))?;
                Ok(created.experiment_id)
            }
            Err(failure) => Err(failure.into_error("get_experiment")),
        }
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<CreatedRun, TrackingError> {
        let body = json!({
            "experiment_id": experiment_id,
            "run_name": name,
            "start_time": chrono::Utc::now().timestamp_millis(),
            "tags": key_values(tags),
        });
        let created: RunEnvelope = self
            .post("runs/create", body)
            .await
            .map_err(|f| f.into_error("create_run"))?;
        Ok(CreatedRun {
            run_id: created.run.info.run_id,
            artifact_uri: created.run.info.artifact_uri,
        })
    }

    async fn log_batch(&self, run_id: &str, batch: LogBatch) -> Result<(), TrackingError> {
        if batch.is_empty() {
            return Ok(());
        }
        let timestamp = chrono::Utc::now().timestamp_millis();
        let metrics: Vec<Value> = batch
            .metrics
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v, "timestamp": timestamp, "step": 0 }))
            .collect();
        let body = json!({
            "run_id": run_id,
            "params": key_values(batch.params.iter().map(|(k, v)| (k, v))),
            "metrics": metrics,
            "tags": key_values(batch.tags.iter().map(|(k, v)| (k, v))),
        });
        let _: Value = self
            .post("runs/log-batch", body)
            .await
            .map_err(|f| f.into_error("log_batch"))?;
        Ok(())
    }

    async fn upload_artifact(
        &self,
        run: &RunHandle,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TrackingError> {
        let root = artifact_proxy_path(&run.artifact_uri).ok_or_else(|| {
            TrackingError::backend(
                "upload_artifact",
                format!(
                    "artifact root {} is not served by the tracking server",
                    run.artifact_uri
                ),
            )
        })?;
        let url = format!(
            "{}/{}/{}/{}",
            self.base_url,
            ARTIFACT_PREFIX,
            root,
            path.trim_start_matches('/')
        );
        debug!("PUT {} ({} bytes)", url, bytes.len());
        let _: Value = self
            .call(self.request(Method::PUT, &url).body(bytes))
            .await
            .map_err(|f| f.into_error("upload_artifact"))?;
        Ok(())
    }

    async fn update_run(&self, run_id: &str, status: RunStatus) -> Result<(), TrackingError> {
        let body = json!({
            "run_id": run_id,
            "status": status.as_str(),
            "end_time": chrono::Utc::now().timestamp_millis(),
        });
        let _: Value = self
            .post("runs/update", body)
            .await
            .map_err(|f| f.into_error("update_run"))?;
        Ok(())
    }

    async fn register_model(
        &self,
        registration: &ModelRegistration,
    ) -> Result<RegisteredModel, TrackingError> {
        let created: Result<Value, CallFailure> = self
            .post(
                "registered-models/create",
                json!({ "name": registration.name }),
            )
            .await;
        match created {
            Ok(_) => debug!("registered model {} created", registration.name),
            Err(f) if f.error_code == "RESOURCE_ALREADY_EXISTS" => {}
            Err(f) => return Err(f.into_error("register_model")),
        }

        let mut body = json!({
            "name": registration.name,
            "source": registration.source_uri,
            "run_id": registration.run_id,
            "tags": key_values(&registration.tags),
        });
        if let Some(description) = &registration.description {
            body["description"] = json!(description);
        }
        let version: ModelVersionEnvelope = self
            .post("model-versions/create", body)
            .await
            .map_err(|f| f.into_error("create_model_version"))?;

        let number = version
            .model_version
            .version
            .parse::<u64>()
            .map_err(|e| TrackingError::backend("create_model_version", e))?;
        Ok(RegisteredModel {
            name: registration.name.clone(),
            version: number,
            source_uri: registration.source_uri.clone(),
            run_id: registration.run_id.clone(),
            description: registration.description.clone(),
            tags: registration.tags.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_proxy_path() {
        assert_eq!(
            artifact_proxy_path("mlflow-artifacts:/1/abc123/artifacts").as_deref(),
            Some("1/abc123/artifacts")
        );
        assert_eq!(
            artifact_proxy_path("mlflow-artifacts://tracking:5000/1/abc/artifacts").as_deref(),
            Some("1/abc/artifacts")
        );
        assert_eq!(artifact_proxy_path("s3://bucket/1/abc/artifacts"), None);
    }

    #[test]
    fn test_api_url() {
        let backend = MlflowBackend::new("http://localhost:5000/", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.base_url(), "http://localhost:5000");
        assert_eq!(
            backend.api_url("runs/create"),
            "http://localhost:5000/api/2.0/mlflow/runs/create"
        );
    }

    #[test]
    fn test_key_values_shape() {
        let mut tags = BTreeMap::new();
        tags.insert("team".to_string(), "ml".to_string());
        assert_eq!(key_values(&tags), vec![json!({"key": "team", "value": "ml"})]);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_backend_error() {
        let backend = MlflowBackend::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = backend.ensure_experiment("exp").await.unwrap_err();
        assert!(matches!(
            err,
            TrackingError::Backend {
                operation: "get_experiment",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_upload_rejects_foreign_artifact_root() {
        let backend = MlflowBackend::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let run = RunHandle {
            run_id: "r".into(),
            experiment_id: "0".into(),
            name: "n".into(),
            parent_run_id: None,
            artifact_uri: "s3://bucket/0/r/artifacts".into(),
        };
        let err = backend
            .upload_artifact(&run, "model/MLmodel", vec![])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not served"));
    }
}
