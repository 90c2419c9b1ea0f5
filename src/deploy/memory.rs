//! In-memory deployment target with scripted readiness and fault injection.

use super::{DeployError, Deployment, DeploymentRequest, DeploymentStatus, DeploymentTarget};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployCall {
    Get(String),
    Delete(String),
    Create(String),
}

#[derive(Debug)]
struct Entry {
    deployment: Deployment,
    /// `get` calls left before the current transition completes
    countdown: u32,
}

#[derive(Debug, Default)]
struct State {
    deployments: BTreeMap<String, Entry>,
    calls: Vec<DeployCall>,
    ready_after: u32,
    delete_lag: u32,
    never_ready: bool,
    fail_delete: Option<String>,
    fail_create: Option<String>,
}

/// Deployment target simulating asynchronous create and delete
#[derive(Debug, Default)]
pub struct InMemoryDeploymentTarget {
    state: Mutex<State>,
}

impl InMemoryDeploymentTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// New deployments report `Creating` for `polls` probes, then `InService`
    #[must_use]
    pub fn with_ready_after(self, polls: u32) -> Self {
        self.lock().ready_after = polls;
        self
    }

    /// Deleted deployments report `Deleting` for `polls` probes, then vanish
    #[must_use]
    pub fn with_delete_lag(self, polls: u32) -> Self {
        self.lock().delete_lag = polls;
        self
    }

    /// New deployments stay `Creating` forever
    #[must_use]
    pub fn never_ready(self) -> Self {
        self.lock().never_ready = true;
        self
    }

    pub fn fail_delete(&self, message: impl Into<String>) {
        self.lock().fail_delete = Some(message.into());
    }

    pub fn fail_create(&self, message: impl Into<String>) {
        self.lock().fail_create = Some(message.into());
    }

    /// Insert an already running deployment
    pub fn seed(&self, deployment: Deployment) {
        self.lock().deployments.insert(
            deployment.name.clone(),
            Entry {
                deployment,
                countdown: 0,
            },
        );
    }

    pub fn calls(&self) -> Vec<DeployCall> {
        self.lock().calls.clone()
    }

    /// Calls other than `Get`
    pub fn mutations(&self) -> Vec<DeployCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| !matches!(c, DeployCall::Get(_)))
            .cloned()
            .collect()
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.lock()
            .deployments
            .get(name)
            .map(|e| e.deployment.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeploymentTarget for InMemoryDeploymentTarget {
    async fn get(&self, name: &str) -> Result<Option<Deployment>, DeployError> {
        let mut state = self.lock();
        state.calls.push(DeployCall::Get(name.to_string()));

        let gone = matches!(
            state.deployments.get(name),
            Some(e) if e.deployment.status == DeploymentStatus::Deleting && e.countdown == 0
        );
        if gone {
            state.deployments.remove(name);
            return Ok(None);
        }

        let Some(entry) = state.deployments.get_mut(name) else {
            return Ok(None);
        };
        match entry.deployment.status {
            DeploymentStatus::Creating if entry.countdown == 0 => {
                entry.deployment.status = DeploymentStatus::InService;
            }
            DeploymentStatus::Creating | DeploymentStatus::Deleting => {
                entry.countdown = entry.countdown.saturating_sub(1);
            }
            _ => {}
        }
        Ok(Some(entry.deployment.clone()))
    }

    async fn delete(&self, name: &str) -> Result<(), DeployError> {
        let mut state = self.lock();
        state.calls.push(DeployCall::Delete(name.to_string()));
        if let Some(message) = &state.fail_delete {
            return Err(DeployError::backend("delete", name, message));
        }

        if !state.deployments.contains_key(name) {
            return Err(DeployError::backend("delete", name, "no such deployment"));
        }
        let lag = state.delete_lag;
        if lag == 0 {
            state.deployments.remove(name);
        } else if let Some(entry) = state.deployments.get_mut(name) {
            entry.deployment.status = DeploymentStatus::Deleting;
            entry.countdown = lag;
        }
        Ok(())
    }

    async fn create(&self, request: &DeploymentRequest) -> Result<Deployment, DeployError> {
        let mut state = self.lock();
        state.calls.push(DeployCall::Create(request.name.clone()));
        if let Some(message) = &state.fail_create {
            return Err(DeployError::backend("create", &request.name, message));
        }
        if state.deployments.contains_key(&request.name) {
            return Err(DeployError::backend(
                "create",
                &request.name,
                "a deployment with this name already exists",
            ));
        }

        let deployment = Deployment {
            name: request.name.clone(),
            model_uri: request.model_uri.clone(),
            region: request.region.clone(),
            instance_type: request.instance_type.clone(),
            instance_count: request.instance_count,
            status: DeploymentStatus::Creating,
        };
        let countdown = if state.never_ready {
            u32::MAX
        } else {
            state.ready_after
        };
        state.deployments.insert(
            request.name.clone(),
            Entry {
                deployment: deployment.clone(),
                countdown,
            },
        );
        Ok(deployment)
    }
}
