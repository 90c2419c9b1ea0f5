//! In-memory object store for tests and dry runs.

use super::{BackendKind, ObjectStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// One recorded call against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Exists,
    Provision,
    Put(String),
    Get(String),
}

#[derive(Debug, Default)]
struct State {
    provisioned: bool,
    objects: HashMap<String, Vec<u8>>,
    calls: Vec<StoreCall>,
    unavailable: Option<String>,
    rejected_keys: HashMap<String, String>,
}

/// Object store backed by a `HashMap`, recording every call
#[derive(Debug)]
pub struct InMemoryObjectStore {
    name: String,
    state: Mutex<State>,
}

impl InMemoryObjectStore {
    /// Create an unprovisioned store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Create a store that is already provisioned
    pub fn provisioned(name: impl Into<String>) -> Self {
        let store = Self::new(name);
        store.lock().provisioned = true;
        store
    }

    /// Make every subsequent call fail as if the backend were unreachable
    pub fn set_unavailable(&self, message: impl Into<String>) {
        self.lock().unavailable = Some(message.into());
    }

    /// Make `put` fail for one key only
    pub fn reject_put(&self, key: impl Into<String>, message: impl Into<String>) {
        self.lock().rejected_keys.insert(key.into(), message.into());
    }

    /// Calls seen so far, in order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Number of `provision` calls seen so far
    pub fn provision_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| **c == StoreCall::Provision)
            .count()
    }

    /// Keys currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether the container has been provisioned
    pub fn is_provisioned(&self) -> bool {
        self.lock().provisioned
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the map is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, operation: &'static str, call: StoreCall) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(message) = &state.unavailable {
            return Err(StoreError::unavailable(
                operation,
                format!("memory://{}", self.name),
                message,
            ));
        }
        Ok(state)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn identifier(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> Result<bool, StoreError> {
        let state = self.record("exists", StoreCall::Exists)?;
        Ok(state.provisioned)
    }

    async fn provision(&self) -> Result<(), StoreError> {
        let mut state = self.record("provision", StoreCall::Provision)?;
        state.provisioned = true;
        Ok(())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut state = self.record("put", StoreCall::Put(key.to_string()))?;
        if !state.provisioned {
            return Err(StoreError::unavailable(
                "put",
                self.location(key),
                "container does not exist",
            ));
        }
        if let Some(message) = state.rejected_keys.get(key) {
            return Err(StoreError::unavailable("put", self.location(key), message));
        }
        state.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let state = self.record("get", StoreCall::Get(key.to_string()))?;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::ObjectNotFound(self.location(key)))
    }
}
