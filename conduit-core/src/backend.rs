//! Seam to the external systems that actually provision resources.
//!
//! The engine never talks to a broker directly; jobs go through a
//! [`BackendExecutor`] registered per resource type in a [`BackendRegistry`].

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use conduit_model::{Resource, ResourceType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scope::Scope;

/// Failure reported by a backend.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("{description}")]
pub struct BackendError {
    pub description: String,
    /// HTTP-like status of the backend response, when there was one.
    #[serde(default)]
    pub status_code: Option<u16>,
    /// The backend may have created something that must be cleaned up.
    #[serde(default)]
    pub orphan_mitigation_required: bool,
}

impl BackendError {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status_code: None,
            orphan_mitigation_required: false,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn requiring_orphan_mitigation(mut self) -> Self {
        self.orphan_mitigation_required = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Resource is ready.
    Sync { dashboard_url: Option<String> },
    /// Backend accepted the request and finishes it in the background.
    Async {
        poll_handle: Option<String>,
        dashboard_url: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Pending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeprovisionOutcome {
    Sync,
    Async { poll_handle: Option<String> },
}

/// External executor for resource lifecycle actions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    async fn provision(
        &self,
        scope: &Scope,
        resource: &Resource,
    ) -> Result<ProvisionOutcome, BackendError>;

    async fn poll(
        &self,
        scope: &Scope,
        resource: &Resource,
        poll_handle: Option<String>,
    ) -> Result<PollOutcome, BackendError>;

    async fn deprovision(
        &self,
        scope: &Scope,
        resource: &Resource,
    ) -> Result<DeprovisionOutcome, BackendError>;
}

/// Backend executors keyed by the resource type they manage. Resource types
/// without an executor are pure store records.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    executors: HashMap<ResourceType, Arc<dyn BackendExecutor>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.executors.keys().collect();
        kinds.sort();
        f.debug_struct("BackendRegistry")
            .field("resource_types", &kinds)
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        resource_type: ResourceType,
        executor: Arc<dyn BackendExecutor>,
    ) -> &mut Self {
        self.executors.insert(resource_type, executor);
        self
    }

    pub fn with(
        mut self,
        resource_type: ResourceType,
        executor: Arc<dyn BackendExecutor>,
    ) -> Self {
        self.register(resource_type, executor);
        self
    }

    pub fn get(
        &self,
        resource_type: ResourceType,
    ) -> Option<Arc<dyn BackendExecutor>> {
        self.executors.get(&resource_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_by_type() {
        let registry = BackendRegistry::new().with(
            ResourceType::Instance,
            Arc::new(MockBackendExecutor::new()),
        );
        assert!(registry.get(ResourceType::Instance).is_some());
        assert!(registry.get(ResourceType::Plan).is_none());
        assert!(format!("{registry:?}").contains("Instance"));
    }

    #[test]
    fn orphan_flag_survives_serialization() {
        let err = BackendError::new("boom")
            .with_status(500)
            .requiring_orphan_mitigation();
        let json = serde_json::to_value(&err).unwrap();
        let back: BackendError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
