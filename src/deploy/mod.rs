//! Model Deployment
//!
//! Publishes a registered model as a named, managed inference deployment.
//!
//! ## Convergence
//!
//! [`DeploymentClient::deploy`] leaves exactly one live deployment per name:
//!
//! 1. probe the target for an existing deployment with that name
//! 2. if present, delete it and wait until the target no longer reports it
//! 3. create the new deployment
//! 4. when synchronous, poll until it is `InService` or the timeout expires
//!
//! A failed delete aborts before anything is created.

mod http;
mod memory;


pub use http::HttpDeploymentTarget;
pub use memory::{DeployCall, InMemoryDeploymentTarget};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Configuration
// ============================================================================

/// Deployment settings shared by every model the pipeline deploys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Role the serving platform assumes to pull the model
    pub execution_role_arn: String,
    /// Bucket the platform stages model artifacts in
    pub bucket_name: String,
    /// Serving container image
    pub image_url: String,
    pub region: String,
    pub instance_type: String,
    pub instance_count: u32,
    /// Wait for the deployment to reach `InService`
    pub synchronous: bool,
    /// Upper bound for each wait (deletion and readiness)
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Model flavor the serving image loads
    pub flavor: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            execution_role_arn: String::new(),
            bucket_name: String::new(),
            image_url: String::new(),
            region: "eu-north-1".to_string(),
            instance_type: "ml.m5.4xlarge".to_string(),
            instance_count: 1,
            synchronous: true,
            timeout_secs: 30_000,
            poll_interval_ms: 10_000,
            flavor: "python_function".to_string(),
        }
    }
}

impl DeploymentConfig {
    #[must_use]
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_role(mut self, execution_role_arn: impl Into<String>) -> Self {
        self.execution_role_arn = execution_role_arn.into();
        self
    }

    #[must_use]
    pub fn with_bucket(mut self, bucket_name: impl Into<String>) -> Self {
        self.bucket_name = bucket_name.into();
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    #[must_use]
    pub fn with_instance(mut self, instance_type: impl Into<String>, count: u32) -> Self {
        self.instance_type = instance_type.into();
        self.instance_count = count.max(1);
        self
    }

    #[must_use]
    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = flavor.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ============================================================================
// Deployments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Creating,
    InService,
    Updating,
    Deleting,
    Failed,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Creating => "Creating",
            DeploymentStatus::InService => "InService",
            DeploymentStatus::Updating => "Updating",
            DeploymentStatus::Deleting => "Deleting",
            DeploymentStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// A deployment as reported by the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub model_uri: String,
    pub region: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub status: DeploymentStatus,
}

/// Everything the target needs to create a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub name: String,
    pub model_uri: String,
    pub flavor: String,
    pub image_url: String,
    pub region: String,
    pub execution_role_arn: String,
    pub bucket_name: String,
    pub instance_type: String,
    pub instance_count: u32,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("deployment {name} did not converge within {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("failed to delete existing deployment {name}: {message}")]
    DeleteFailed { name: String, message: String },

    #[error("failed to create deployment {name}: {message}")]
    CreationFailed { name: String, message: String },

    #[error("deployment target error during {operation} on {name}: {message}")]
    Backend {
        operation: &'static str,
        name: String,
        message: String,
    },
}

impl DeployError {
    pub(crate) fn backend(
        operation: &'static str,
        name: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        Self::Backend {
            operation,
            name: name.into(),
            message: message.to_string(),
        }
    }
}

// ============================================================================
// Target contract
// ============================================================================

/// A managed inference platform
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    /// Current deployment with this name, if any
    async fn get(&self, name: &str) -> Result<Option<Deployment>, DeployError>;

    /// Start deleting a deployment; completion is observed through `get`
    async fn delete(&self, name: &str) -> Result<(), DeployError>;

    /// Start creating a deployment
    async fn create(&self, request: &DeploymentRequest) -> Result<Deployment, DeployError>;
}

// ============================================================================
// Client
// ============================================================================

/// Converges a named deployment onto a model
pub struct DeploymentClient {
    target: Arc<dyn DeploymentTarget>,
    config: DeploymentConfig,
}

impl fmt::Debug for DeploymentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeploymentClient {
    pub fn new(target: Arc<dyn DeploymentTarget>, config: DeploymentConfig) -> Self {
        Self { target, config }
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    /// Deploy `model_uri` as `name`, replacing any deployment of that name.
    ///
    /// `image_reference`, `region` and `role_identity` override the
    /// configured values when given.
    pub async fn deploy(
        &self,
        model_uri: &str,
        name: &str,
        image_reference: Option<&str>,
        region: Option<&str>,
        role_identity: Option<&str>,
    ) -> Result<Deployment, DeployError> {
        let request = DeploymentRequest {
            name: name.to_string(),
            model_uri: model_uri.to_string(),
            flavor: self.config.flavor.clone(),
            image_url: image_reference.unwrap_or(&self.config.image_url).to_string(),
            region: region.unwrap_or(&self.config.region).to_string(),
            execution_role_arn: role_identity
                .unwrap_or(&self.config.execution_role_arn)
                .to_string(),
            bucket_name: self.config.bucket_name.clone(),
            instance_type: self.config.instance_type.clone(),
            instance_count: self.config.instance_count,
        };

        if let Some(existing) = self.target.get(name).await? {
            info!(
                "Replacing deployment {} (currently {}, model {})",
                name, existing.status, existing.model_uri
            );
            self.target
                .delete(name)
                .await
                .map_err(|e| DeployError::DeleteFailed {
                    name: name.to_string(),
                    message: e.to_string(),
                })?;
            self.wait_until_gone(name).await?;
        }

        info!(
            "Creating deployment {} in {} ({} x {})",
            name, request.region, request.instance_count, request.instance_type
        );
        let created = self
            .target
            .create(&request)
            .await
            .map_err(|e| DeployError::CreationFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        if !self.config.synchronous {
            return Ok(created);
        }
        let live = self.wait_until_in_service(name).await?;
        info!("Deployment {} is InService", name);
        Ok(live)
    }

    fn timed_out(&self, name: &str) -> DeployError {
        DeployError::Timeout {
            name: name.to_string(),
            timeout_secs: self.config.timeout_secs,
        }
    }

    async fn wait_until_gone(&self, name: &str) -> Result<(), DeployError> {
        tokio::time::timeout(self.config.timeout(), self.poll_until_gone(name))
            .await
            .map_err(|_| self.timed_out(name))?
    }

    async fn wait_until_in_service(&self, name: &str) -> Result<Deployment, DeployError> {
        tokio::time::timeout(self.config.timeout(), self.poll_until_in_service(name))
            .await
            .map_err(|_| self.timed_out(name))?
    }

    async fn poll_until_gone(&self, name: &str) -> Result<(), DeployError> {
        loop {
            match self.target.get(name).await? {
                None => return Ok(()),
                Some(d) => debug!("{} still {}", name, d.status),
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn poll_until_in_service(&self, name: &str) -> Result<Deployment, DeployError> {
        loop {
            match self.target.get(name).await? {
                Some(d) if d.status == DeploymentStatus::InService => return Ok(d),
                Some(d) if d.status == DeploymentStatus::Failed => {
                    return Err(DeployError::CreationFailed {
                        name: name.to_string(),
                        message: "target reported status Failed".to_string(),
                    })
                }
                Some(d) => debug!("{} is {}", name, d.status),
                None => {
                    return Err(DeployError::CreationFailed {
                        name: name.to_string(),
                        message: "deployment disappeared while creating".to_string(),
                    })
                }
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}
