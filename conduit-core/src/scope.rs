//! Execution scope carried through every engine call.
//!
//! A [`Scope`] bundles the cancellation signal of the caller with the
//! operation currently being executed, if any. It is passed explicitly to the
//! store, jobs, and backend executors so collaborators such as repository
//! interceptors can branch on the in-flight operation.

use std::sync::Arc;

use conduit_model::{Operation, TransitiveResource};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

#[derive(Clone, Debug, Default)]
pub struct Scope {
    cancel: CancellationToken,
    operation: Option<Arc<Operation>>,
    transitive: Arc<Mutex<Vec<TransitiveResource>>>,
}

impl Scope {
    /// Top-level scope with its own cancellation signal.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Derived scope: cancelled whenever `self` is cancelled, and cancellable
    /// on its own without affecting `self`.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            operation: self.operation.clone(),
            transitive: Arc::clone(&self.transitive),
        }
    }

    /// Derived scope carrying `operation`. Fails when the operation does not
    /// pass its own validation.
    pub fn with_operation(&self, operation: Operation) -> Result<Self> {
        operation.validate()?;
        Ok(Self {
            cancel: self.cancel.child_token(),
            operation: Some(Arc::new(operation)),
            transitive: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn operation(&self) -> Option<&Operation> {
        self.operation.as_deref()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Errors with [`EngineError::Cancelled`] once the scope has ended.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            let what = self
                .operation
                .as_ref()
                .map(|op| format!("operation {}", op.id))
                .unwrap_or_else(|| "scope".to_string());
            return Err(EngineError::Cancelled(format!("{what} was cancelled")));
        }
        Ok(())
    }

    /// Records a side-effect resource change for the in-flight operation.
    /// Ignored when no operation is carried.
    pub async fn record_transitive(&self, resource: TransitiveResource) {
        if self.operation.is_none() {
            return;
        }
        let mut guard = self.transitive.lock().await;
        if !guard.contains(&resource) {
            guard.push(resource);
        }
    }

    pub async fn take_transitive(&self) -> Vec<TransitiveResource> {
        std::mem::take(&mut *self.transitive.lock().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_model::{OperationCategory, ResourceType};

    #[test]
    fn invalid_operation_is_rejected() {
        let scope = Scope::root();
        let op = Operation::new(
            "  ",
            ResourceType::Instance,
            OperationCategory::Create,
        );
        assert!(scope.with_operation(op).is_err());
    }

    #[test]
    fn child_scope_follows_parent_cancellation() {
        let root = Scope::root();
        let op = Operation::new(
            "i1",
            ResourceType::Instance,
            OperationCategory::Create,
        );
        let scoped = root.with_operation(op.clone()).unwrap();
        assert_eq!(scoped.operation().map(|o| o.id), Some(op.id));
        assert!(root.operation().is_none());

        let sibling = root.child();
        sibling.cancel();
        assert!(!root.is_cancelled());
        assert!(!scoped.is_cancelled());

        root.cancel();
        assert!(scoped.is_cancelled());
        assert!(scoped.ensure_active().is_err());
    }

    #[tokio::test]
    async fn transitive_resources_need_an_operation() {
        let entry = TransitiveResource {
            resource_type: ResourceType::Plan,
            operation_type: OperationCategory::Delete,
        };

        let bare = Scope::root();
        bare.record_transitive(entry.clone()).await;
        assert!(bare.take_transitive().await.is_empty());

        let op = Operation::new(
            "b1",
            ResourceType::Broker,
            OperationCategory::Update,
        );
        let scoped = Scope::root().with_operation(op).unwrap();
        scoped.record_transitive(entry.clone()).await;
        scoped.record_transitive(entry.clone()).await;
        assert_eq!(scoped.take_transitive().await, vec![entry]);
    }
}
