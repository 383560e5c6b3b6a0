use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_model::{
    Operation, OperationCategory, OperationId, OperationState, ResourceType,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata envelope attached to every operation event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub operation_id: OperationId,
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub category: OperationCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascade_root_id: Option<OperationId>,
    pub emitted_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn for_operation(operation: &Operation) -> Self {
        Self {
            version: 1,
            operation_id: operation.id,
            resource_id: operation.resource_id.clone(),
            resource_type: operation.resource_type,
            category: operation.category,
            correlation_id: operation.correlation_id.clone(),
            cascade_root_id: operation.cascade_root_id,
            emitted_at: Utc::now(),
        }
    }
}

/// Lifecycle notifications emitted by the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OperationEventPayload {
    Scheduled,
    Started,
    /// An asynchronous backend action is outstanding; a later pass resumes.
    Rescheduled { external_id: Option<String> },
    Succeeded,
    Failed {
        #[serde(skip_serializing_if = "Option::is_none")]
        errors: Option<serde_json::Value>,
        orphan_mitigation: bool,
    },
}

impl OperationEventPayload {
    /// Final state carried by the event, for terminal events only.
    pub fn terminal_state(&self) -> Option<OperationState> {
        match self {
            OperationEventPayload::Succeeded => Some(OperationState::Succeeded),
            OperationEventPayload::Failed { .. } => Some(OperationState::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationEvent {
    pub meta: EventMeta,
    pub payload: OperationEventPayload,
}

impl OperationEvent {
    pub fn new(operation: &Operation, payload: OperationEventPayload) -> Self {
        Self {
            meta: EventMeta::for_operation(operation),
            payload,
        }
    }

    /// Event describing where `operation` ended after a job run.
    pub fn settled(operation: &Operation) -> Self {
        let payload = match operation.state {
            OperationState::Succeeded => OperationEventPayload::Succeeded,
            OperationState::Failed => OperationEventPayload::Failed {
                errors: operation.errors.clone(),
                orphan_mitigation: operation.deletion_scheduled.is_some(),
            },
            OperationState::InProgress => OperationEventPayload::Rescheduled {
                external_id: operation.external_id.clone(),
            },
            OperationState::Pending => OperationEventPayload::Scheduled,
        };
        Self::new(operation, payload)
    }
}

#[async_trait]
pub trait OperationEventPublisher: Send + Sync {
    async fn publish(&self, event: OperationEvent) -> Result<()>;
}
