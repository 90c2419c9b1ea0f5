//! Azure blob container backend.
//!
//! The container is addressed through a named datastore registered in a
//! workspace; the datastore name is what appears in locations
//! (`azureml://<datastore>/<key>`), the container name is what the Blob REST
//! API is called with.
//!
//! REST verbs used:
//!
//! | Operation   | Request                                   |
//! |-------------|-------------------------------------------|
//! | `exists`    | `HEAD /<container>?restype=container`     |
//! | `provision` | `PUT  /<container>?restype=container`     |
//! | `put`       | `PUT  /<container>/<blob>` (BlockBlob)    |
//! | `get`       | `GET  /<container>/<blob>`                |

use super::{BackendKind, ObjectStore, StoreError};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Blob service API version sent with every request
pub const BLOB_API_VERSION: &str = "2021-08-06";

/// How requests against the blob service are authorised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContainerCredential {
    /// Shared access signature appended to the query string
    Sas(String),
    /// OAuth bearer token
    Bearer(String),
    /// Public container
    Anonymous,
}

/// Connection settings for one blob container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Storage account name
    pub account: String,
    /// Blob container name
    pub container: String,
    /// Workspace datastore registered for the container
    pub datastore: String,
    /// Overrides `https://<account>.blob.core.windows.net` (e.g. Azurite)
    pub endpoint: Option<String>,
    /// Request timeout
    pub timeout_secs: u64,
    pub credential: ContainerCredential,
}

impl ContainerConfig {
    #[must_use]
    pub fn new(account: impl Into<String>, container: impl Into<String>) -> Self {
        let container = container.into();
        Self {
            account: account.into(),
            datastore: container.clone(),
            container,
            endpoint: None,
            timeout_secs: 60,
            credential: ContainerCredential::Anonymous,
        }
    }

    #[must_use]
    pub fn with_datastore(mut self, datastore: impl Into<String>) -> Self {
        self.datastore = datastore.into();
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_credential(mut self, credential: ContainerCredential) -> Self {
        self.credential = credential;
        self
    }

    /// Base URL of the blob service
    pub fn service_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.account),
        }
    }

    /// URL of the container resource
    pub fn container_url(&self) -> String {
        format!("{}/{}?restype=container", self.service_url(), self.container)
    }

    /// URL of one blob
    pub fn blob_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.service_url(),
            self.container,
            key.trim_start_matches('/')
        )
    }
}

/// Appends a SAS token to a URL that may already carry a query string
fn with_sas(url: &str, sas: &str) -> String {
    let sas = sas.trim_start_matches('?');
    if url.contains('?') {
        format!("{url}&{sas}")
    } else {
        format!("{url}?{sas}")
    }
}

/// Outcome of a container probe, by HTTP status
pub(crate) fn classify_probe(status: StatusCode) -> Option<bool> {
    match status {
        s if s.is_success() => Some(true),
        StatusCode::NOT_FOUND => Some(false),
        _ => None,
    }
}

/// Object store over one Azure blob container
#[derive(Debug, Clone)]
pub struct ContainerStore {
    config: ContainerConfig,
    client: reqwest::Client,
}

impl ContainerStore {
    pub fn new(config: ContainerConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("labflow/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StoreError::unavailable("connect", config.service_url(), e))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = match &self.config.credential {
            ContainerCredential::Sas(sas) => self.client.request(method, with_sas(url, sas)),
            ContainerCredential::Bearer(token) => {
                self.client.request(method, url).bearer_auth(token)
            }
            ContainerCredential::Anonymous => self.client.request(method, url),
        };
        builder.header("x-ms-version", BLOB_API_VERSION)
    }
}

#[async_trait]
impl ObjectStore for ContainerStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn identifier(&self) -> &str {
        &self.config.datastore
    }

    async fn exists(&self) -> Result<bool, StoreError> {
        let url = self.config.container_url();
        let response = self
            .request(Method::HEAD, &url)
            .send()
            .await
            .map_err(|e| StoreError::unavailable("exists", &self.config.container, e))?;

        classify_probe(response.status()).ok_or_else(|| {
            StoreError::unavailable(
                "exists",
                &self.config.container,
                format!("HTTP {}", response.status()),
            )
        })
    }

    async fn provision(&self) -> Result<(), StoreError> {
        let url = self.config.container_url();
        let response = self
            .request(Method::PUT, &url)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| StoreError::unavailable("provision", &self.config.container, e))?;

        let status = response.status();
        // 409 ContainerAlreadyExists: the service-side create-if-absent already holds.
        if status.is_success() || status == StatusCode::CONFLICT {
            debug!(
                "container {} provisioned (HTTP {})",
                self.config.container, status
            );
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::unavailable(
            "provision",
            &self.config.container,
            format!("HTTP {status}: {body}"),
        ))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let url = self.config.blob_url(key);
        let response = self
            .request(Method::PUT, &url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| StoreError::unavailable("put", self.location(key), e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::unavailable(
            "put",
            self.location(key),
            format!("HTTP {status}: {body}"),
        ))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.config.blob_url(key);
        let response = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| StoreError::unavailable("get", self.location(key), e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::ObjectNotFound(self.location(key))),
            status if status.is_success() => response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| StoreError::unavailable("get", self.location(key), e)),
            status => Err(StoreError::unavailable(
                "get",
                self.location(key),
                format!("HTTP {status}"),
            )),
        }
    }
}
