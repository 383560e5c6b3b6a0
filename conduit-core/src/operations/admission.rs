//! Ownership of operations across executors.
//!
//! The scheduler and the worker pool both run jobs. Before either starts one
//! it claims the operation id in the shared [`ActiveOperations`] set and
//! stores the operation with [`store_for_run`]; the claim is released when
//! the run ends.

use std::collections::HashSet;

use conduit_model::{Operation, OperationId};
use tokio::sync::Mutex;

use crate::{
    error::{EngineError, Result},
    scope::Scope,
    store::{OperationStore, Repository},
};

/// Operations currently owned by a running job.
#[derive(Debug, Default)]
pub struct ActiveOperations {
    ids: Mutex<HashSet<OperationId>>,
}

impl ActiveOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `operation_id`. Fails with
    /// [`EngineError::Conflict`] while another run holds it.
    pub async fn claim(&self, operation_id: OperationId) -> Result<()> {
        if self.ids.lock().await.insert(operation_id) {
            Ok(())
        } else {
            Err(EngineError::Conflict(format!(
                "operation {operation_id} is already running"
            )))
        }
    }

    pub async fn release(&self, operation_id: OperationId) {
        self.ids.lock().await.remove(&operation_id);
    }

    pub async fn contains(&self, operation_id: OperationId) -> bool {
        self.ids.lock().await.contains(&operation_id)
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ids.lock().await.is_empty()
    }
}

/// Persists `operation` ahead of its run: created when new, overwritten when
/// stored in the same state. A stored operation whose state moved on since
/// the job was built is rejected with [`EngineError::Conflict`].
pub async fn store_for_run(
    repo: &dyn Repository,
    scope: &Scope,
    operation: Operation,
) -> Result<Operation> {
    operation.validate()?;
    match repo.get_operation(scope, operation.id).await {
        Ok(stored) if stored.state != operation.state => Err(EngineError::Conflict(format!(
            "operation {} is {} in the store, expected {}",
            operation.id, stored.state, operation.state
        ))),
        Ok(_) => repo.update_operation(scope, operation).await,
        Err(EngineError::NotFound(_)) => repo.create_operation(scope, operation).await,
        Err(err) => Err(err),
    }
}
