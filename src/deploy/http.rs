//! Deployment target speaking JSON over HTTP.
//!
//! Endpoints, relative to the base URL:
//!
//! - `GET /deployments/{name}` - 200 with a [`Deployment`], 404 when absent
//! - `DELETE /deployments/{name}` - 2xx, or 404 when already gone
//! - `POST /deployments` - body [`DeploymentRequest`], 2xx with a [`Deployment`]

use super::{DeployError, Deployment, DeploymentRequest, DeploymentTarget};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpDeploymentTarget {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpDeploymentTarget {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DeployError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .user_agent(concat!("labflow/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| DeployError::backend("connect", &base_url, e))?;
        Ok(Self {
            base_url,
            client,
            token: None,
        })
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn deployment_url(&self, name: &str) -> String {
        format!("{}/deployments/{}", self.base_url, name)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

async fn failure(operation: &'static str, name: &str, response: reqwest::Response) -> DeployError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    DeployError::backend(operation, name, format!("HTTP {status}: {body}"))
}

#[async_trait]
impl DeploymentTarget for HttpDeploymentTarget {
    async fn get(&self, name: &str) -> Result<Option<Deployment>, DeployError> {
        let url = self.deployment_url(name);
        debug!("GET {}", url);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| DeployError::backend("get", name, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .json::<Deployment>()
                .await
                .map(Some)
                .map_err(|e| DeployError::backend("get", name, e)),
            _ => Err(failure("get", name, response).await),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), DeployError> {
        let url = self.deployment_url(name);
        debug!("DELETE {}", url);
        let response = self
            .authorized(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| DeployError::backend("delete", name, e))?;

        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            _ => Err(failure("delete", name, response).await),
        }
    }

    async fn create(&self, request: &DeploymentRequest) -> Result<Deployment, DeployError> {
        let url = format!("{}/deployments", self.base_url);
        debug!("POST {} ({})", url, request.name);
        let response = self
            .authorized(self.client.post(&url).json(request))
            .send()
            .await
            .map_err(|e| DeployError::backend("create", &request.name, e))?;

        if !response.status().is_success() {
            return Err(failure("create", &request.name, response).await);
        }
        response
            .json::<Deployment>()
            .await
            .map_err(|e| DeployError::backend("create", &request.name, e))
    }
}
