//! Instance provisioning with asynchronous polling and orphan mitigation.
//!
//! Each run of [`ProvisionInstanceJob`] picks one branch from the state of its
//! operation:
//!
//! * inside the orphan-mitigation window: delete whatever the backend may
//!   have created, then end FAILED;
//! * `reschedule` set: poll the outstanding backend action;
//! * otherwise: provision.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conduit_model::{Operation, Resource, ResourceType, ServiceInstance};
use tracing::{debug, info, warn};

use super::job::{Job, JobKind, JobOutcome};
use crate::{
    backend::{
        BackendError, BackendExecutor, DeprovisionOutcome, PollOutcome,
        ProvisionOutcome,
    },
    error::{EngineError, Result},
    scope::Scope,
    store::{Criterion, Object, OperationStore, Repository},
};

#[derive(Clone)]
pub struct ProvisionInstanceJob {
    operation: Operation,
    instance: ServiceInstance,
    backend: Arc<dyn BackendExecutor>,
    orphan_mitigation_grace: Duration,
    max_polling_duration: Duration,
}

impl fmt::Debug for ProvisionInstanceJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionInstanceJob")
            .field("operation", &self.operation.id)
            .field("instance", &self.instance.id)
            .field("backend", &"BackendExecutor")
            .field("orphan_mitigation_grace", &self.orphan_mitigation_grace)
            .field("max_polling_duration", &self.max_polling_duration)
            .finish()
    }
}

impl ProvisionInstanceJob {
    pub fn new(
        operation: Operation,
        instance: ServiceInstance,
        backend: Arc<dyn BackendExecutor>,
    ) -> Self {
        Self {
            operation,
            instance,
            backend,
            orphan_mitigation_grace: Duration::hours(12),
            max_polling_duration: Duration::days(7),
        }
    }

    pub fn with_orphan_mitigation_grace(mut self, grace: std::time::Duration) -> Self {
        self.orphan_mitigation_grace =
            Duration::from_std(grace).unwrap_or(Duration::MAX);
        self
    }

    pub fn with_max_polling_duration(mut self, max: std::time::Duration) -> Self {
        self.max_polling_duration = Duration::from_std(max).unwrap_or(Duration::MAX);
        self
    }

    fn resource(&self) -> Resource {
        Resource::Instance(self.instance.clone())
    }

    async fn provision(
        &self,
        scope: &Scope,
        operation: &mut Operation,
        repo: &dyn Repository,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        let outcome = match self.backend.provision(scope, &self.resource()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let mitigate = err.orphan_mitigation_required;
                let err = schedule_mitigation(operation, err, now);
                if !mitigate {
                    return Err(err);
                }
                // Mitigation is resumed from the stored instance.
                return match repo.create(scope, self.resource().into()).await {
                    Ok(_) | Err(EngineError::Conflict(_)) => Err(err),
                    Err(store_err) => Err(EngineError::compound(err, store_err)),
                };
            }
        };

        let mut instance = self.instance.clone();
        let pending = match outcome {
            ProvisionOutcome::Sync { dashboard_url } => {
                instance.ready = true;
                instance.usable = true;
                instance.dashboard_url = dashboard_url;
                false
            }
            ProvisionOutcome::Async {
                poll_handle,
                dashboard_url,
            } => {
                instance.ready = false;
                instance.dashboard_url = dashboard_url;
                operation.is_async = true;
                operation.reschedule = true;
                operation.external_id = poll_handle;
                operation.reschedule_timestamp.get_or_insert(now);
                true
            }
        };

        // The backend holds the instance now; failing to record it orphans it.
        let stored = match repo.create(scope, Resource::Instance(instance).into()).await {
            Ok(stored) => stored,
            Err(err) => {
                operation.clear_reschedule();
                operation.deletion_scheduled.get_or_insert(now);
                return Err(err);
            }
        };

        if pending {
            debug!(
                operation_id = %operation.id,
                instance_id = %self.instance.id,
                external_id = ?operation.external_id,
                "provisioning continues asynchronously"
            );
            Ok(JobOutcome::Pending)
        } else {
            Ok(JobOutcome::Completed(Some(stored)))
        }
    }

    async fn poll(
        &self,
        scope: &Scope,
        operation: &mut Operation,
        repo: &dyn Repository,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        if let Some(started) = operation.reschedule_timestamp
            && now.signed_duration_since(started) > self.max_polling_duration
        {
            warn!(
                operation_id = %operation.id,
                instance_id = %self.instance.id,
                "polling window exhausted; scheduling orphan mitigation"
            );
            operation.clear_reschedule();
            operation.deletion_scheduled.get_or_insert(now);
            return Err(EngineError::Timeout(format!(
                "instance {} did not finish provisioning within {}h",
                self.instance.id,
                self.max_polling_duration.num_hours()
            )));
        }

        let status = match self
            .backend
            .poll(scope, &self.resource(), operation.external_id.clone())
            .await
        {
            Ok(status) => status,
            Err(err) => {
                operation.clear_reschedule();
                return Err(schedule_mitigation(operation, err, now));
            }
        };

        match status {
            PollOutcome::Pending => Ok(JobOutcome::Pending),
            PollOutcome::Completed => {
                operation.clear_reschedule();
                let mut instance = match repo
                    .get_resource(scope, ResourceType::Instance, &self.instance.id)
                    .await?
                {
                    Resource::Instance(instance) => instance,
                    other => {
                        return Err(EngineError::Internal(format!(
                            "expected an instance, got {}",
                            other.resource_type()
                        )));
                    }
                };
                instance.ready = true;
                instance.usable = true;
                let stored = repo.update(scope, Resource::Instance(instance).into()).await?;
                Ok(JobOutcome::Completed(Some(stored)))
            }
        }
    }

    async fn mitigate(
        &self,
        scope: &Scope,
        operation: &mut Operation,
        repo: &dyn Repository,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        let resource = self.resource();
        let finished = if operation.reschedule {
            match self
                .backend
                .poll(scope, &resource, operation.external_id.clone())
                .await?
            {
                PollOutcome::Pending => return Ok(JobOutcome::Pending),
                PollOutcome::Completed => true,
            }
        } else {
            match self.backend.deprovision(scope, &resource).await? {
                DeprovisionOutcome::Sync => true,
                DeprovisionOutcome::Async { poll_handle } => {
                    operation.is_async = true;
                    operation.reschedule = true;
                    operation.external_id = poll_handle;
                    operation.reschedule_timestamp.get_or_insert(now);
                    false
                }
            }
        };
        if !finished {
            return Ok(JobOutcome::Pending);
        }

        repo.delete(
            scope,
            ResourceType::Instance.into(),
            &[Criterion::eq("id", self.instance.id.as_str())],
        )
        .await?;
        operation.clear_reschedule();
        info!(
            operation_id = %operation.id,
            instance_id = %self.instance.id,
            "orphan mitigation completed"
        );
        Ok(JobOutcome::Mitigated)
    }
}

/// Records the first moment compensating deletion became necessary. A later
/// failure within the same episode keeps the original timestamp.
fn schedule_mitigation(
    operation: &mut Operation,
    err: BackendError,
    now: DateTime<Utc>,
) -> EngineError {
    if err.orphan_mitigation_required {
        operation.deletion_scheduled.get_or_insert(now);
    }
    EngineError::Backend(err)
}

#[async_trait]
impl Job for ProvisionInstanceJob {
    fn kind(&self) -> JobKind {
        JobKind::Provision
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
        let now = Utc::now();
        if operation.in_orphan_mitigation_window(now, self.orphan_mitigation_grace) {
            self.mitigate(scope, operation, repo, now).await
        } else if operation.reschedule {
            self.poll(scope, operation, repo, now).await
        } else {
            self.provision(scope, operation, repo, now).await
        }
    }
}

/// Instance stored for `object`, if it is one.
pub fn instance_of(object: &Object) -> Option<&ServiceInstance> {
    match object.as_resource() {
        Some(Resource::Instance(instance)) => Some(instance),
        _ => None,
    }
}
