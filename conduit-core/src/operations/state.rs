//! Operation lifecycle transitions.
//!
//! ```text
//! PENDING     -> IN_PROGRESS
//! IN_PROGRESS -> IN_PROGRESS   (rescheduled poll pass)
//! IN_PROGRESS -> SUCCEEDED | FAILED
//! FAILED      -> IN_PROGRESS   (orphan mitigation or a timed-out poll)
//! ```
//!
//! SUCCEEDED is final.

use chrono::Utc;
use conduit_model::{Operation, OperationState};

use crate::error::{EngineError, Result};

pub fn can_transition(operation: &Operation, to: OperationState) -> bool {
    use OperationState::*;
    match (operation.state, to) {
        (Pending, InProgress) => true,
        (InProgress, InProgress | Succeeded | Failed) => true,
        (Failed, InProgress) => {
            operation.deletion_scheduled.is_some() || operation.reschedule
        }
        _ => false,
    }
}

/// Moves `operation` to `to` and bumps `updated_at`.
pub fn transition(operation: &mut Operation, to: OperationState) -> Result<()> {
    if !can_transition(operation, to) {
        return Err(EngineError::InvalidTransition {
            id: operation.id,
            from: operation.state,
            to,
        });
    }
    operation.state = to;
    operation.updated_at = Utc::now();
    Ok(())
}
