//! Core data model definitions shared across Conduit crates.
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod ids;
pub mod operation;
pub mod resource;

// Intentionally curated re-exports for downstream consumers.
pub use config::{CascadeConfig, EngineConfig, OperationsConfig, PoolConfig};
pub use error::{ModelError, Result as ModelResult};
pub use ids::OperationId;
pub use operation::{
    Operation, OperationCategory, OperationState, TransitiveResource,
};
pub use resource::{
    Broker, Labels, Platform, Resource, ResourceType, ServiceBinding,
    ServiceInstance, ServiceOffering, ServicePlan, Tenant, Visibility,
};
