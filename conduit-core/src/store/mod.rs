//! Storage contract consumed by the engine.
//!
//! The engine is storage-agnostic: everything it persists goes through the
//! [`Repository`] trait. [`memory::InMemoryRepository`] is the reference
//! implementation and [`interceptor::InterceptableRepository`] layers
//! per-type hooks on top of any repository.

pub mod criteria;
pub mod interceptor;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use conduit_model::{Labels, Operation, OperationId, Resource, ResourceType};

use crate::{
    error::{EngineError, Result},
    scope::Scope,
};

pub use criteria::{Criterion, FieldValue, Operator, Order, Queryable};

/// Kind of record kept by a repository.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ObjectType {
    Operation,
    Resource(ResourceType),
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Operation => f.write_str("operation"),
            ObjectType::Resource(kind) => write!(f, "{kind}"),
        }
    }
}

impl From<ResourceType> for ObjectType {
    fn from(value: ResourceType) -> Self {
        ObjectType::Resource(value)
    }
}

/// Any persisted record.
#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    Operation(Operation),
    Resource(Resource),
}

impl Object {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Object::Operation(_) => ObjectType::Operation,
            Object::Resource(r) => ObjectType::Resource(r.resource_type()),
        }
    }

    pub fn id(&self) -> String {
        match self {
            Object::Operation(op) => op.id.to_string(),
            Object::Resource(r) => r.id().to_string(),
        }
    }

    pub fn as_operation(&self) -> Option<&Operation> {
        match self {
            Object::Operation(op) => Some(op),
            Object::Resource(_) => None,
        }
    }

    pub fn as_resource(&self) -> Option<&Resource> {
        match self {
            Object::Resource(r) => Some(r),
            Object::Operation(_) => None,
        }
    }

    pub fn into_operation(self) -> Result<Operation> {
        match self {
            Object::Operation(op) => Ok(op),
            other => Err(EngineError::Internal(format!(
                "expected an operation, got {}",
                other.object_type()
            ))),
        }
    }

    pub fn into_resource(self) -> Result<Resource> {
        match self {
            Object::Resource(r) => Ok(r),
            Object::Operation(op) => Err(EngineError::Internal(format!(
                "expected a resource, got operation {}",
                op.id
            ))),
        }
    }

    pub(crate) fn touch(&mut self, now: chrono::DateTime<chrono::Utc>) {
        match self {
            Object::Operation(op) => op.updated_at = now,
            Object::Resource(r) => r.touch(now),
        }
    }
}

impl From<Operation> for Object {
    fn from(value: Operation) -> Self {
        Object::Operation(value)
    }
}

impl From<Resource> for Object {
    fn from(value: Resource) -> Self {
        Object::Resource(value)
    }
}

impl Queryable for Object {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match self {
            Object::Operation(op) => op.field(name),
            Object::Resource(r) => Queryable::field(r, name),
        }
    }

    fn labels(&self) -> &Labels {
        match self {
            Object::Operation(op) => &op.labels,
            Object::Resource(r) => r.labels(),
        }
    }
}

/// Persistence for operations and resources.
///
/// Every call carries the caller's [`Scope`]; implementations must refuse
/// work once it is cancelled.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Fails with [`EngineError::Conflict`] when the id already exists.
    async fn create(&self, scope: &Scope, object: Object) -> Result<Object>;

    /// Fails with [`EngineError::NotFound`] when the id does not exist.
    async fn update(&self, scope: &Scope, object: Object) -> Result<Object>;

    /// Deletes every record matching `criteria` and returns them. Matching
    /// nothing is not an error.
    async fn delete(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Object>>;

    async fn get(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        id: &str,
    ) -> Result<Object>;

    async fn list(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Object>>;
}

/// Typed helpers over [`Repository`] for operation records.
#[async_trait]
pub trait OperationStore: Repository {
    async fn get_operation(
        &self,
        scope: &Scope,
        id: OperationId,
    ) -> Result<Operation> {
        self.get(scope, ObjectType::Operation, &id.to_string())
            .await?
            .into_operation()
    }

    async fn list_operations(
        &self,
        scope: &Scope,
        criteria: &[Criterion],
    ) -> Result<Vec<Operation>> {
        self.list(scope, ObjectType::Operation, criteria)
            .await?
            .into_iter()
            .map(Object::into_operation)
            .collect()
    }

    async fn create_operation(
        &self,
        scope: &Scope,
        operation: Operation,
    ) -> Result<Operation> {
        self.create(scope, Object::Operation(operation))
            .await?
            .into_operation()
    }

    async fn update_operation(
        &self,
        scope: &Scope,
        operation: Operation,
    ) -> Result<Operation> {
        self.update(scope, Object::Operation(operation))
            .await?
            .into_operation()
    }

    async fn get_resource(
        &self,
        scope: &Scope,
        resource_type: ResourceType,
        id: &str,
    ) -> Result<Resource> {
        self.get(scope, ObjectType::Resource(resource_type), id)
            .await?
            .into_resource()
    }

    async fn list_resources(
        &self,
        scope: &Scope,
        resource_type: ResourceType,
        criteria: &[Criterion],
    ) -> Result<Vec<Resource>> {
        self.list(scope, ObjectType::Resource(resource_type), criteria)
            .await?
            .into_iter()
            .map(Object::into_resource)
            .collect()
    }
}

impl<R: Repository + ?Sized> OperationStore for R {}
