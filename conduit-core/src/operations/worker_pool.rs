//! Standalone pool: a bounded queue drained by a fixed set of workers.
//!
//! Producers hand jobs to a [`JobQueue`]; submission is non-blocking and a
//! full queue rejects the job with [`EngineError::Busy`]. Workers share the
//! scheduler's [`ActiveOperations`]: a dequeued job whose operation is
//! already running elsewhere, or was stored in another state since the job
//! was built, is dropped.

use std::{fmt, sync::Arc, time::Duration};

use conduit_model::OperationId;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

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

struct QueuedJob {
    scope: Scope,
    job: Box<dyn Job>,
}

/// Producer side of the worker pool.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<QueuedJob>,
    capacity: usize,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.capacity)
            .field("free", &self.tx.capacity())
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl JobQueue {
    /// Enqueues `job` without waiting. Fails with [`EngineError::Busy`] when
    /// the queue is full or the pool has stopped.
    pub fn try_submit(&self, scope: &Scope, job: Box<dyn Job>) -> Result<OperationId> {
        let operation_id = job.operation().id;
        job.operation().validate()?;
        self.tx
            .try_send(QueuedJob {
                scope: scope.child(),
                job,
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => EngineError::Busy(format!(
                    "job queue is full ({} pending)",
                    self.capacity
                )),
                mpsc::error::TrySendError::Closed(_) => {
                    EngineError::Busy("worker pool has stopped".into())
                }
            })?;
        Ok(operation_id)
    }
}

pub struct WorkerPool {
    workers: usize,
    repo: Arc<dyn Repository>,
    runner: Arc<JobRunner>,
    active: Arc<ActiveOperations>,
    rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let started = self.handles.try_lock().map(|h| h.len()).ok();
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("started", &started)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        capacity: usize,
        repo: Arc<dyn Repository>,
        runner: Arc<JobRunner>,
        active: Arc<ActiveOperations>,
        shutdown: CancellationToken,
        shutdown_grace: Duration,
    ) -> (Self, JobQueue) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let pool = Self {
            workers,
            repo,
            runner,
            active,
            rx: Arc::new(Mutex::new(rx)),
            handles: Mutex::new(Vec::new()),
            shutdown,
            shutdown_grace,
        };
        (pool, JobQueue { tx, capacity })
    }

    /// Spawns the workers. Each one claims and persists the job's operation
    /// before running it; a job that cannot be claimed or stored is dropped.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }
        for i in 0..self.workers {
            let worker_id = format!("worker-{i}");
            let rx = Arc::clone(&self.rx);
            let repo = Arc::clone(&self.repo);
            let runner = Arc::clone(&self.runner);
            let active = Arc::clone(&self.active);
            let shutdown = self.shutdown.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => None,
                        queued = async { rx.lock().await.recv().await } => queued,
                    };
                    let Some(QueuedJob { scope, job }) = next else {
                        debug!(target: "conduit::scheduler", worker = %worker_id, "worker stopping");
                        break;
                    };

                    let operation_id = job.operation().id;
                    if let Err(err) = active.claim(operation_id).await {
                        warn!(
                            target: "conduit::scheduler",
                            worker = %worker_id,
                            %operation_id,
                            error = %err,
                            "dropping job: operation is owned by another run"
                        );
                        continue;
                    }
                    if let Err(err) =
                        admission::store_for_run(repo.as_ref(), &scope, job.operation().clone())
                            .await
                    {
                        error!(
                            target: "conduit::scheduler",
                            worker = %worker_id,
                            %operation_id,
                            error = %err,
                            "dropping job: operation could not be stored"
                        );
                        active.release(operation_id).await;
                        continue;
                    }
                    if let Err(err) = runner.run(scope, job).await {
                        debug!(
                            target: "conduit::scheduler",
                            worker = %worker_id,
                            %operation_id,
                            error = %err,
                            "job finished with error"
                        );
                    }
                    active.release(operation_id).await;
                }
            }));
        }
        info!(target: "conduit::scheduler", workers = self.workers, "worker pool started");
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            match tokio::time::timeout(self.shutdown_grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: "conduit::scheduler", "worker task failed: {err:?}"),
                Err(_) => warn!(target: "conduit::scheduler", "worker timed out during shutdown"),
            }
        }
        // Reject anything still queued.
        self.rx.lock().await.close();
    }
}
