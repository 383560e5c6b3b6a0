use conduit_model::{Operation, OperationId, OperationState};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    scope::Scope,
    store::{Criterion, OperationStore, Repository},
};

/// Roll-up of a parent's child operations, bucketed by state. An operation
/// with an unfinished orphan mitigation counts only as mitigating.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadedOperations {
    pub all_operations_count: usize,
    pub succeeded: Vec<OperationId>,
    pub in_progress: Vec<OperationId>,
    pub pending: Vec<OperationId>,
    pub failed: Vec<OperationId>,
    pub in_orphan_mitigation: Vec<OperationId>,
}

impl CascadedOperations {
    pub fn from_operations<'a>(children: impl IntoIterator<Item = &'a Operation>) -> Self {
        let mut rollup = Self::default();
        for op in children {
            rollup.all_operations_count += 1;
            if op.in_orphan_mitigation() {
                rollup.in_orphan_mitigation.push(op.id);
                continue;
            }
            let bucket = match op.state {
                OperationState::Succeeded => &mut rollup.succeeded,
                OperationState::InProgress => &mut rollup.in_progress,
                OperationState::Pending => &mut rollup.pending,
                OperationState::Failed => &mut rollup.failed,
            };
            bucket.push(op.id);
        }
        rollup
    }

    /// Loads and rolls up the direct children of `parent_id`.
    pub async fn for_parent(
        repo: &dyn Repository,
        scope: &Scope,
        parent_id: OperationId,
    ) -> Result<Self> {
        let children = repo
            .list_operations(scope, &[Criterion::eq("parent_id", parent_id)])
            .await?;
        Ok(Self::from_operations(&children))
    }

    /// No child is still pending, running, or mitigating.
    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
            && self.in_progress.is_empty()
            && self.in_orphan_mitigation.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conduit_model::{OperationCategory, ResourceType};

    fn op(state: OperationState) -> Operation {
        let mut op = Operation::new("x", ResourceType::Instance, OperationCategory::Delete);
        op.state = state;
        op
    }

    #[test]
    fn buckets_by_state() {
        let mut mitigating = op(OperationState::Failed);
        mitigating.deletion_scheduled = Some(Utc::now());
        let ops = [
            op(OperationState::Succeeded),
            op(OperationState::Failed),
            op(OperationState::Pending),
            mitigating,
        ];
        let rollup = CascadedOperations::from_operations(&ops);
        assert_eq!(rollup.all_operations_count, 4);
        assert_eq!(rollup.succeeded.len(), 1);
        assert_eq!(rollup.failed.len(), 1);
        assert_eq!(rollup.pending.len(), 1);
        assert_eq!(rollup.in_orphan_mitigation.len(), 1);
        assert!(!rollup.is_settled());
        assert!(rollup.has_failures());
    }

    #[test]
    fn no_children_is_settled() {
        let rollup = CascadedOperations::from_operations(&Vec::<Operation>::new());
        assert!(rollup.is_settled());
        assert!(!rollup.has_failures());
    }
}
