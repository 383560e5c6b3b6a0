use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    error::{ModelError, Result},
    ids::OperationId,
    resource::{Labels, ResourceType},
};

/// Kind of mutation an operation performs on its resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    Create,
    Update,
    Delete,
}

impl OperationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::Create => "create",
            OperationCategory::Update => "update",
            OperationCategory::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::InProgress => "in_progress",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side-effect resource change recorded while an operation ran, e.g. plans
/// removed from the catalog during a broker update.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TransitiveResource {
    pub resource_type: ResourceType,
    pub operation_type: OperationCategory,
}

/// Durable record of one pending, in-flight, or completed mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub resource_id: String,
    pub resource_type: ResourceType,
    #[serde(rename = "type")]
    pub category: OperationCategory,
    pub state: OperationState,

    #[serde(default)]
    pub reschedule: bool,
    #[serde(default)]
    pub reschedule_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub is_async: bool,

    #[serde(default)]
    pub deletion_scheduled: Option<DateTime<Utc>>,

    #[serde(default)]
    pub parent_id: Option<OperationId>,
    #[serde(default)]
    pub cascade_root_id: Option<OperationId>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub platform_id: Option<String>,

    #[serde(default)]
    pub errors: Option<serde_json::Value>,
    #[serde(default)]
    pub transitive_resources: Vec<TransitiveResource>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Labels,
}

impl Operation {
    /// Fresh PENDING operation for a resource.
    pub fn new(
        resource_id: impl Into<String>,
        resource_type: ResourceType,
        category: OperationCategory,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            resource_id: resource_id.into(),
            resource_type,
            category,
            state: OperationState::Pending,
            reschedule: false,
            reschedule_timestamp: None,
            external_id: None,
            is_async: false,
            deletion_scheduled: None,
            parent_id: None,
            cascade_root_id: None,
            correlation_id: None,
            platform_id: None,
            errors: None,
            transitive_resources: Vec::new(),
            created_at: now,
            updated_at: now,
            labels: Labels::new(),
        }
    }

    /// Root of a cascade delete tree: it is its own cascade root.
    pub fn new_cascade_root(
        resource_id: impl Into<String>,
        resource_type: ResourceType,
    ) -> Self {
        let mut op =
            Self::new(resource_id, resource_type, OperationCategory::Delete);
        op.cascade_root_id = Some(op.id);
        op
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_platform_id(mut self, platform_id: impl Into<String>) -> Self {
        self.platform_id = Some(platform_id.into());
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_cascade(&self) -> bool {
        self.cascade_root_id.is_some()
    }

    pub fn is_cascade_root(&self) -> bool {
        self.cascade_root_id == Some(self.id) && self.parent_id.is_none()
    }

    /// Compensating deletion was requested and has not yet finished.
    pub fn in_orphan_mitigation(&self) -> bool {
        self.deletion_scheduled.is_some()
            && self.state != OperationState::Succeeded
    }

    /// Orphan mitigation is still worth retrying: it was requested less than
    /// `grace` ago.
    pub fn in_orphan_mitigation_window(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> bool {
        match self.deletion_scheduled {
            Some(scheduled) => {
                self.state != OperationState::Succeeded
                    && now.signed_duration_since(scheduled) < grace
            }
            None => false,
        }
    }

    /// Clears polling bookkeeping once a backend action finished.
    pub fn clear_reschedule(&mut self) {
        self.reschedule = false;
        self.reschedule_timestamp = None;
        self.external_id = None;
    }

    /// Self-check applied before an operation is carried in an execution
    /// scope or persisted.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(ModelError::InvalidOperation(
                "operation id is empty".into(),
            ));
        }
        if self.resource_id.trim().is_empty() {
            return Err(ModelError::InvalidOperation(format!(
                "operation {} has no resource id",
                self.id
            )));
        }
        if self.parent_id.is_some() && self.cascade_root_id.is_none() {
            return Err(ModelError::InvalidOperation(format!(
                "operation {} has a parent but no cascade root",
                self.id
            )));
        }
        if self.parent_id == Some(self.id) {
            return Err(ModelError::InvalidOperation(format!(
                "operation {} is its own parent",
                self.id
            )));
        }
        if self.parent_id.is_some()
            && self.category != OperationCategory::Delete
        {
            return Err(ModelError::InvalidOperation(format!(
                "cascade operation {} must be a delete",
                self.id
            )));
        }
        Ok(())
    }
}
