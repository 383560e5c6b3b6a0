//! Units of work executed by the scheduler and the worker pool.
//!
//! A [`Job`] binds one [`Operation`] to one storage mutation. The shared
//! bookkeeping around it (state transitions, error capture, deadline) lives in
//! [`JobRunner`](super::runner::JobRunner); a job only performs the mutation
//! and reports how it ended.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conduit_model::{Operation, ResourceType};
use tracing::{debug, warn};

use crate::{
    backend::{BackendExecutor, DeprovisionOutcome, PollOutcome},
    error::{EngineError, Result},
    scope::Scope,
    store::{Criterion, Object, ObjectType, OperationStore, Repository},
};

/// How a job's mutation ended when it did not fail.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    /// Done. Carries the written object when there is one.
    Completed(Option<Object>),
    /// An asynchronous backend action is still running. The operation stays
    /// IN_PROGRESS with its polling bookkeeping set.
    Pending,
    /// Compensating deletion finished. The operation ends FAILED with the
    /// errors of the original failure.
    Mitigated,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobKind {
    Create,
    Update,
    Delete,
    Provision,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Create => "create",
            JobKind::Update => "update",
            JobKind::Delete => "delete",
            JobKind::Provision => "provision",
        }
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn kind(&self) -> JobKind;

    /// The operation this job executes, as it should be persisted before the
    /// first run.
    fn operation(&self) -> &Operation;

    /// Performs the mutation. `operation` is the working copy; polling and
    /// orphan-mitigation bookkeeping set on it is persisted by the runner
    /// whatever the result.
    async fn execute(
        &self,
        scope: &Scope,
        operation: &mut Operation,
        repo: &dyn Repository,
    ) -> Result<JobOutcome>;
}

/// Stores a new object.
#[derive(Clone, Debug)]
pub struct CreateJob {
    operation: Operation,
    object: Object,
}

impl CreateJob {
    pub fn new(operation: Operation, object: impl Into<Object>) -> Self {
        Self {
            operation,
            object: object.into(),
        }
    }
}

#[async_trait]
impl Job for CreateJob {
    fn kind(&self) -> JobKind {
        JobKind::Create
    }

    fn operation(&self) -> &Operation {
        &self.operation
    }

    async fn execute(
        &self,
        scope: &Scope,
        _operation: &mut Operation,
        repo: &dyn Repository,
    ) -> Result<JobOutcome> {
        let created = repo.create(scope, self.object.clone()).await?;
        Ok(JobOutcome::Completed(Some(created)))
    }
}

/// Overwrites an existing object.
#[derive(Clone, Debug)]
pub struct UpdateJob {
    operation: Operation,
    object: Object,
}

impl UpdateJob {
    pub fn new(operation: Operation, object: impl Into<Object>) -> Self {
        Self {
            operation,
            object: object.into(),
        }
    }
}

#[async_trait]
impl Job for UpdateJob {
    fn kind(&self) -> JobKind {
        JobKind::Update
    }

    fn operation(&self) -> &Operation {
        &self.operation
    }

    async fn execute(
        &self,
        scope: &Scope,
        _operation: &mut Operation,
        repo: &dyn Repository,
    ) -> Result<JobOutcome> {
        let updated = repo.update(scope, self.object.clone()).await?;
        Ok(JobOutcome::Completed(Some(updated)))
    }
}

/// Removes the records matching its criteria. When a backend manages the
/// resource type, the resource is deprovisioned there first and the record
/// is removed once the backend confirms. An asynchronous deprovision that is
/// still pending after `max_polling_duration` fails the operation.
#[derive(Clone)]
pub struct DeleteJob {
    operation: Operation,
    object_type: ObjectType,
    criteria: Vec<Criterion>,
    backend: Option<Arc<dyn BackendExecutor>>,
    max_polling_duration: Duration,
}

impl fmt::Debug for DeleteJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteJob")
            .field("operation", &self.operation.id)
            .field("object_type", &self.object_type)
            .field("criteria", &self.criteria)
            .field("backend", &self.backend.as_ref().map(|_| "BackendExecutor"))
            .field("max_polling_duration", &self.max_polling_duration)
            .finish()
    }
}

impl DeleteJob {
    pub fn new(
        operation: Operation,
        object_type: ObjectType,
        criteria: Vec<Criterion>,
    ) -> Self {
        Self {
            operation,
            object_type,
            criteria,
            backend: None,
            max_polling_duration: Duration::days(7),
        }
    }

    /// Deletes the resource the operation points at.
    pub fn for_operation(operation: Operation) -> Self {
        let criteria = vec![Criterion::eq("id", operation.resource_id.as_str())];
        let object_type = ObjectType::Resource(operation.resource_type);
        Self::new(operation, object_type, criteria)
    }

    pub fn with_backend(mut self, backend: Arc<dyn BackendExecutor>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_max_polling_duration(mut self, max: std::time::Duration) -> Self {
        self.max_polling_duration = Duration::from_std(max).unwrap_or(Duration::MAX);
        self
    }

    fn polling_exhausted(&self, operation: &Operation, now: DateTime<Utc>) -> bool {
        operation
            .reschedule_timestamp
            .is_some_and(|started| now.signed_duration_since(started) > self.max_polling_duration)
    }

    async fn delete_records(
        &self,
        scope: &Scope,
        repo: &dyn Repository,
    ) -> Result<JobOutcome> {
        if self.object_type == ObjectType::Resource(ResourceType::Tenant) {
            return Ok(JobOutcome::Completed(None));
        }
        let deleted = repo.delete(scope, self.object_type, &self.criteria).await?;
        debug!(
            object_type = %self.object_type,
            count = deleted.len(),
            "deleted records"
        );
        Ok(JobOutcome::Completed(None))
    }
}

#[async_trait]
impl Job for DeleteJob {
    fn kind(&self) -> JobKind {
        JobKind::Delete
    }

    fn operation(&self) -> &Operation {
        &self.operation
    }

    async fn execute(
        &self,
        scope: &Scope,
        operation: &mut Operation,
        repo: &dyn Repository,
    ) -> Result<JobOutcome> {
        let Some(backend) = &self.backend else {
            return self.delete_records(scope, repo).await;
        };
        let ObjectType::Resource(resource_type) = self.object_type else {
            return self.delete_records(scope, repo).await;
        };

        let resource = match repo
            .get_resource(scope, resource_type, &operation.resource_id)
            .await
        {
            Ok(resource) => resource,
            // Already gone: nothing left to deprovision.
            Err(EngineError::NotFound(_)) => return Ok(JobOutcome::Completed(None)),
            Err(err) => return Err(err),
        };

        if operation.reschedule {
            if self.polling_exhausted(operation, Utc::now()) {
                warn!(
                    operation_id = %operation.id,
                    resource_id = %operation.resource_id,
                    "polling window exhausted; giving up on deprovision"
                );
                operation.clear_reschedule();
                return Err(EngineError::Timeout(format!(
                    "{} {} was not deprovisioned within {}h",
                    resource_type,
                    operation.resource_id,
                    self.max_polling_duration.num_hours()
                )));
            }
            let status = match backend
                .poll(scope, &resource, operation.external_id.clone())
                .await
            {
                Ok(status) => status,
                Err(err) => {
                    operation.clear_reschedule();
                    return Err(err.into());
                }
            };
            return match status {
                PollOutcome::Pending => Ok(JobOutcome::Pending),
                PollOutcome::Completed => {
                    operation.clear_reschedule();
                    self.delete_records(scope, repo).await
                }
            };
        }

        match backend.deprovision(scope, &resource).await? {
            DeprovisionOutcome::Sync => self.delete_records(scope, repo).await,
            DeprovisionOutcome::Async { poll_handle } => {
                operation.is_async = true;
                operation.reschedule = true;
                operation.external_id = poll_handle;
                operation.reschedule_timestamp.get_or_insert(Utc::now());
                Ok(JobOutcome::Pending)
            }
        }
    }
}
