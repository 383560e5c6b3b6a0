//! Error aggregation for cascade parents.
//!
//! A parent whose children failed carries one flat list of the leaf
//! failures. Nested aggregates are flattened: each entry keeps the failed
//! resource and its error, and is re-parented to the operation absorbing it.
//!
//! ```json
//! {"cascade_errors": [
//!   {"parent_type": "plan", "parent_id": "p1",
//!    "resource_type": "instance", "resource_id": "i1",
//!    "error": {"error": "BackendError", "description": "..."}}
//! ]}
//! ```

use conduit_model::{Operation, OperationState, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;

pub const CASCADE_ERRORS_KEY: &str = "cascade_errors";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CascadeErrorEntry {
    pub parent_type: ResourceType,
    pub parent_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub error: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeErrors {
    pub cascade_errors: Vec<CascadeErrorEntry>,
}

impl CascadeErrors {
    /// Reads an aggregate back from an operation's error payload. Payloads
    /// that are not aggregates yield `None`.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        payload.get(CASCADE_ERRORS_KEY)?;
        serde_json::from_value(payload.clone()).ok()
    }

    /// Collects the failures among `children` under `parent`.
    pub fn aggregate(parent: &Operation, children: &[&Operation]) -> Self {
        let mut entries = Vec::new();
        for child in children.iter().filter(|c| c.state == OperationState::Failed) {
            let nested = child.errors.as_ref().and_then(Self::from_payload);
            match nested {
                Some(nested) => {
                    entries.extend(nested.cascade_errors.into_iter().map(|mut entry| {
                        entry.parent_type = parent.resource_type;
                        entry.parent_id = parent.resource_id.clone();
                        entry
                    }));
                }
                None => entries.push(CascadeErrorEntry {
                    parent_type: parent.resource_type,
                    parent_id: parent.resource_id.clone(),
                    resource_type: child.resource_type,
                    resource_id: child.resource_id.clone(),
                    error: child.errors.clone().unwrap_or_else(|| {
                        json!({
                            "error": "Failed",
                            "description": format!(
                                "delete of {} {} failed",
                                child.resource_type, child.resource_id
                            ),
                        })
                    }),
                }),
            }
        }
        Self {
            cascade_errors: entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cascade_errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cascade_errors.len()
    }

    pub fn into_payload(self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
