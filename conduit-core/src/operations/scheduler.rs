use std::{fmt, sync::Arc, time::Duration};

use conduit_model::OperationId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use super::{
    admission::{self, ActiveOperations},
    job::Job,
    runner::JobRunner,
};
use crate::{
    error::{EngineError, Result},
    scope::Scope,
    store::Repository,
};

/// Admits jobs into a fixed number of execution slots and runs each one in
/// the background. Admission never waits: with every slot taken the job is
/// rejected with [`EngineError::Busy`]. An operation that is already
/// admitted, here or in the worker pool, cannot be admitted again until its
/// run ends.
pub struct Scheduler {
    repo: Arc<dyn Repository>,
    runner: Arc<JobRunner>,
    slots: Arc<Semaphore>,
    active: Arc<ActiveOperations>,
    pool_size: usize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pool_size", &self.pool_size)
            .field("available", &self.slots.available_permits())
            .field("running", &self.tracker.len())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn Repository>,
        runner: Arc<JobRunner>,
        active: Arc<ActiveOperations>,
        pool_size: usize,
        shutdown: CancellationToken,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            repo,
            runner,
            slots: Arc::new(Semaphore::new(pool_size)),
            active,
            pool_size,
            tracker: TaskTracker::new(),
            shutdown,
            shutdown_grace,
        }
    }

    /// Admits `job`, persists its operation and starts it in the background.
    ///
    /// The operation is created, or overwritten when it is already stored so
    /// a resumed operation keeps its id. A stored operation whose state moved
    /// on since the job was built is rejected with [`EngineError::Conflict`].
    /// The slot stays held until the job finishes. When admission or
    /// persistence fails the job never runs.
    pub async fn schedule(&self, scope: &Scope, job: Box<dyn Job>) -> Result<OperationId> {
        let operation_id = job.operation().id;
        self.active.claim(operation_id).await?;
        let permit = match self.admit(scope, job.as_ref()).await {
            Ok(permit) => permit,
            Err(err) => {
                self.active.release(operation_id).await;
                return Err(err);
            }
        };

        let runner = Arc::clone(&self.runner);
        let active = Arc::clone(&self.active);
        let job_scope = scope.child();
        self.tracker.spawn(async move {
            let _permit = permit;
            if let Err(err) = runner.run(job_scope, job).await {
                debug!(
                    target: "conduit::scheduler",
                    %operation_id,
                    error = %err,
                    "job finished with error"
                );
            }
            active.release(operation_id).await;
        });
        debug!(target: "conduit::scheduler", %operation_id, "job scheduled");
        Ok(operation_id)
    }

    async fn admit(&self, scope: &Scope, job: &dyn Job) -> Result<OwnedSemaphorePermit> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Busy("scheduler is shutting down".into()));
        }
        let permit = Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
            EngineError::Busy(format!("all {} worker slots are busy", self.pool_size))
        })?;
        admission::store_for_run(self.repo.as_ref(), scope, job.operation().clone()).await?;
        Ok(permit)
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of jobs still executing.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Stops admitting work, signals running jobs to stop and waits up to the
    /// grace period for them. Jobs still running afterwards are abandoned.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                target: "conduit::scheduler",
                abandoned = self.tracker.len(),
                "scheduler shutdown grace elapsed; abandoning running jobs"
            );
        } else {
            info!(target: "conduit::scheduler", "scheduler stopped");
        }
    }
}
