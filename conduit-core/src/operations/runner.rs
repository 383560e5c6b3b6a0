use std::{fmt, sync::Arc, time::Duration};

use conduit_model::{Operation, OperationState};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

use super::{
    job::{Job, JobOutcome},
    state,
};
use crate::{
    error::{EngineError, Result},
    events::{OperationEvent, OperationEventPayload, OperationEventPublisher},
    scope::Scope,
    store::{OperationStore, Repository},
};

/// Shared execution algorithm for every job: mark the operation IN_PROGRESS,
/// run the mutation under a deadline, then persist where it ended.
pub struct JobRunner {
    repo: Arc<dyn Repository>,
    events: Arc<dyn OperationEventPublisher>,
    job_timeout: Duration,
    shutdown: CancellationToken,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("repo", &"Repository")
            .field("events", &"OperationEventPublisher")
            .field("job_timeout", &self.job_timeout)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl JobRunner {
    pub fn new(
        repo: Arc<dyn Repository>,
        events: Arc<dyn OperationEventPublisher>,
        job_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repo,
            events,
            job_timeout,
            shutdown,
        }
    }

    /// Runs `job` to its next resting state and returns the operation as
    /// persisted. Errors are the job's own failure, possibly compounded with
    /// a failure to record it.
    pub async fn run(&self, scope: Scope, job: Box<dyn Job>) -> Result<Operation> {
        let operation = job.operation().clone();
        let span = info_span!(
            target: "conduit::scheduler",
            "job",
            operation_id = %operation.id,
            kind = job.kind().as_str(),
            resource_type = %operation.resource_type,
            resource_id = %operation.resource_id,
        );
        self.run_inner(scope, job.as_ref(), operation)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        scope: Scope,
        job: &dyn Job,
        mut operation: Operation,
    ) -> Result<Operation> {
        if let Err(err) = state::transition(&mut operation, OperationState::InProgress) {
            warn!(target: "conduit::scheduler", error = %err, "operation cannot start");
            return Err(err);
        }
        operation = self.repo.update_operation(&scope, operation).await?;
        self.publish(OperationEvent::new(&operation, OperationEventPayload::Started))
            .await;

        let job_scope = match scope.with_operation(operation.clone()) {
            Ok(job_scope) => job_scope,
            Err(err) => return self.record_failure(&scope, operation, err).await,
        };

        let outcome = tokio::select! {
            res = job.execute(&job_scope, &mut operation, self.repo.as_ref()) => res,
            _ = tokio::time::sleep(self.job_timeout) => {
                job_scope.cancel();
                Err(EngineError::Timeout(format!(
                    "job exceeded {}s deadline",
                    self.job_timeout.as_secs()
                )))
            }
            _ = self.shutdown.cancelled() => {
                job_scope.cancel();
                Err(EngineError::Cancelled("engine is shutting down".into()))
            }
            _ = scope.cancelled() => {
                Err(EngineError::Cancelled("caller scope ended".into()))
            }
        };

        for entry in job_scope.take_transitive().await {
            if !operation.transitive_resources.contains(&entry) {
                operation.transitive_resources.push(entry);
            }
        }

        match outcome {
            Ok(JobOutcome::Completed(_)) => {
                operation.clear_reschedule();
                operation.deletion_scheduled = None;
                operation.errors = None;
                state::transition(&mut operation, OperationState::Succeeded)?;
                self.persist(operation).await
            }
            Ok(JobOutcome::Pending) => {
                state::transition(&mut operation, OperationState::InProgress)?;
                self.persist(operation).await
            }
            Ok(JobOutcome::Mitigated) => {
                operation.deletion_scheduled = None;
                operation.clear_reschedule();
                state::transition(&mut operation, OperationState::Failed)?;
                self.persist(operation).await
            }
            Err(err) => self.record_failure(&scope, operation, err).await,
        }
    }

    async fn record_failure(
        &self,
        scope: &Scope,
        mut operation: Operation,
        err: EngineError,
    ) -> Result<Operation> {
        let cancelled = scope.is_cancelled() || self.shutdown.is_cancelled();
        warn!(
            target: "conduit::scheduler",
            error = %err,
            orphan_mitigation = operation.deletion_scheduled.is_some(),
            cancelled,
            "job failed"
        );
        operation.errors = Some(err.to_payload());
        if let Err(transition) = state::transition(&mut operation, OperationState::Failed) {
            return Err(EngineError::compound(err, transition));
        }
        match self.persist(operation).await {
            Ok(_) => Err(err),
            Err(store_err) => Err(EngineError::compound(err, store_err)),
        }
    }

    async fn persist(&self, operation: Operation) -> Result<Operation> {
        // The caller scope may already be cancelled; the result must still be
        // recorded.
        let write_scope = Scope::root();
        match self.repo.update_operation(&write_scope, operation).await {
            Ok(stored) => {
                debug!(
                    target: "conduit::scheduler",
                    state = %stored.state,
                    reschedule = stored.reschedule,
                    "operation settled"
                );
                self.publish(OperationEvent::settled(&stored)).await;
                Ok(stored)
            }
            Err(store_err) => {
                error!(
                    target: "conduit::scheduler",
                    error = %store_err,
                    "failed to persist operation state"
                );
                Err(store_err)
            }
        }
    }

    async fn publish(&self, event: OperationEvent) {
        if let Err(err) = self.events.publish(event).await {
            warn!(target: "conduit::scheduler", error = %err, "failed to publish operation event");
        }
    }
}
