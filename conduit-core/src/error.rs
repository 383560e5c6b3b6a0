use conduit_model::{ModelError, OperationId, OperationState};
use serde_json::json;
use thiserror::Error;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Worker slots or queue capacity exhausted. Callers should retry later.
    #[error("Service unavailable: {0}")]
    Busy(String),

    #[error("Invalid transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: OperationId,
        from: OperationState,
        to: OperationState,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A failure that was followed by a second failure while recording it.
    #[error("{primary}; additionally: {secondary}")]
    Compound {
        primary: Box<EngineError>,
        secondary: Box<EngineError>,
    },
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        EngineError::Validation(err.to_string())
    }
}

impl EngineError {
    pub fn compound(primary: EngineError, secondary: EngineError) -> Self {
        EngineError::Compound {
            primary: Box::new(primary),
            secondary: Box::new(secondary),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }

    /// Stable error class used in persisted error payloads.
    pub fn class(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NotFound",
            EngineError::Conflict(_) => "Conflict",
            EngineError::Busy(_) => "ServiceUnavailable",
            EngineError::InvalidTransition { .. } => "InvalidTransition",
            EngineError::Validation(_) => "BadRequest",
            EngineError::Backend(_) => "BackendError",
            EngineError::Timeout(_) => "Timeout",
            EngineError::Cancelled(_) => "Cancelled",
            EngineError::Serialization(_) => "Serialization",
            EngineError::Internal(_) => "InternalError",
            EngineError::Compound { primary, .. } => primary.class(),
        }
    }

    /// Raw payload stored in `Operation::errors`.
    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            EngineError::Backend(err) => json!({
                "error": self.class(),
                "description": err.description,
                "status_code": err.status_code,
            }),
            _ => json!({
                "error": self.class(),
                "description": self.to_string(),
            }),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
