//! Bottom-up driver for persisted cascade trees.
//!
//! A PENDING cascade operation is executed only once every child operation
//! has settled. If any child failed the parent fails without running, and
//! carries the aggregated child errors; otherwise its delete is scheduled.
//! Passes are triggered when a tree is created, when a cascade operation
//! finishes, and periodically.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use conduit_model::{Operation, OperationId, OperationState};
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{errors::CascadeErrors, status::CascadedOperations};
use crate::{
    backend::BackendRegistry,
    error::{EngineError, Result},
    events::{OperationEvent, OperationEventPublisher},
    operations::{DeleteJob, Scheduler, state},
    scope::Scope,
    store::{Criterion, FieldValue, OperationStore, Repository},
};

/// What one pass over a tree did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CascadePass {
    pub scheduled: usize,
    pub failed: usize,
    /// Parents whose children are still running.
    pub waiting: usize,
    /// Ready operations left PENDING because no worker slot was free.
    pub deferred: usize,
}

impl std::ops::AddAssign for CascadePass {
    fn add_assign(&mut self, other: Self) {
        self.scheduled += other.scheduled;
        self.failed += other.failed;
        self.waiting += other.waiting;
        self.deferred += other.deferred;
    }
}

pub struct CascadeProcessor {
    repo: Arc<dyn Repository>,
    scheduler: Arc<Scheduler>,
    backends: BackendRegistry,
    events: Arc<dyn OperationEventPublisher>,
    interval: Duration,
    max_polling_duration: Option<Duration>,
    holds: Mutex<HashSet<OperationId>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for CascadeProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CascadeProcessor")
            .field("scheduler", &self.scheduler)
            .field("backends", &self.backends)
            .field("interval", &self.interval)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl CascadeProcessor {
    pub fn new(
        repo: Arc<dyn Repository>,
        scheduler: Arc<Scheduler>,
        backends: BackendRegistry,
        events: Arc<dyn OperationEventPublisher>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repo,
            scheduler,
            backends,
            events,
            interval,
            max_polling_duration: None,
            holds: Mutex::new(HashSet::new()),
            handle: Mutex::new(None),
            shutdown,
        }
    }

    /// Polling window handed to the delete jobs this processor schedules.
    pub fn with_max_polling_duration(mut self, max: Duration) -> Self {
        self.max_polling_duration = Some(max);
        self
    }

    /// Keeps passes away from the tree rooted at `root_id` until
    /// [`release`](Self::release) is called. Used while a tree is still being
    /// stored.
    pub async fn hold(&self, root_id: OperationId) {
        self.holds.lock().await.insert(root_id);
    }

    pub async fn release(&self, root_id: OperationId) {
        self.holds.lock().await.remove(&root_id);
    }

    /// Advances every operation of the tree rooted at `root_id` that is ready.
    pub async fn process_tree(&self, scope: &Scope, root_id: OperationId) -> Result<CascadePass> {
        if self.holds.lock().await.contains(&root_id) {
            trace!(target: "conduit::cascade", %root_id, "tree is on hold");
            return Ok(CascadePass::default());
        }
        let operations = self
            .repo
            .list_operations(scope, &[Criterion::eq("cascade_root_id", root_id)])
            .await?;

        let mut by_parent: HashMap<OperationId, Vec<&Operation>> = HashMap::new();
        for op in &operations {
            if let Some(parent) = op.parent_id {
                by_parent.entry(parent).or_default().push(op);
            }
        }

        let mut pass = CascadePass::default();
        for op in operations.iter().filter(|op| op.state == OperationState::Pending) {
            let children = by_parent.get(&op.id).map(Vec::as_slice).unwrap_or_default();
            let rollup = CascadedOperations::from_operations(children.iter().copied());
            if !rollup.is_settled() {
                pass.waiting += 1;
                continue;
            }
            if rollup.has_failures() {
                self.fail_with_children(scope, op.clone(), children).await?;
                pass.failed += 1;
                continue;
            }

            let mut job = DeleteJob::for_operation(op.clone());
            if let Some(backend) = self.backends.get(op.resource_type) {
                job = job.with_backend(backend);
            }
            if let Some(max) = self.max_polling_duration {
                job = job.with_max_polling_duration(max);
            }
            match self.scheduler.schedule(scope, Box::new(job)).await {
                Ok(_) => pass.scheduled += 1,
                Err(EngineError::Busy(reason)) => {
                    trace!(target: "conduit::cascade", operation_id = %op.id, %reason, "no free slot");
                    pass.deferred += 1;
                }
                Err(EngineError::Conflict(reason)) => {
                    trace!(target: "conduit::cascade", operation_id = %op.id, %reason, "skipped");
                }
                Err(err) => {
                    warn!(
                        target: "conduit::cascade",
                        operation_id = %op.id,
                        error = %err,
                        "failed to schedule cascade delete"
                    );
                }
            }
        }

        if pass != CascadePass::default() {
            debug!(
                target: "conduit::cascade",
                %root_id,
                scheduled = pass.scheduled,
                failed = pass.failed,
                waiting = pass.waiting,
                deferred = pass.deferred,
                "cascade pass"
            );
        }
        Ok(pass)
    }

    /// Runs a pass over every tree that still has PENDING operations.
    pub async fn process_pending(&self, scope: &Scope) -> Result<CascadePass> {
        let roots: BTreeSet<OperationId> = self
            .repo
            .list_operations(
                scope,
                &[
                    Criterion::eq("state", OperationState::Pending),
                    Criterion::not_eq("cascade_root_id", FieldValue::Null),
                ],
            )
            .await?
            .into_iter()
            .filter_map(|op| op.cascade_root_id)
            .collect();

        let mut total = CascadePass::default();
        for root_id in roots {
            total += self.process_tree(scope, root_id).await?;
        }
        Ok(total)
    }

    async fn fail_with_children(
        &self,
        scope: &Scope,
        mut op: Operation,
        children: &[&Operation],
    ) -> Result<()> {
        let errors = CascadeErrors::aggregate(&op, children);
        info!(
            target: "conduit::cascade",
            operation_id = %op.id,
            resource_type = %op.resource_type,
            resource_id = %op.resource_id,
            failures = errors.len(),
            "children failed; failing cascade parent"
        );
        op.errors = Some(errors.into_payload()?);
        state::transition(&mut op, OperationState::InProgress)?;
        state::transition(&mut op, OperationState::Failed)?;
        let stored = self.repo.update_operation(scope, op).await?;
        if let Err(err) = self.events.publish(OperationEvent::settled(&stored)).await {
            warn!(target: "conduit::cascade", error = %err, "failed to publish cascade event");
        }
        Ok(())
    }

    /// Starts the background loop: a pass over every pending tree on each
    /// tick, and a pass over one tree whenever one of its operations settles.
    pub async fn start(self: &Arc<Self>, mut events: broadcast::Receiver<OperationEvent>) {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        *guard = Some(tokio::spawn(async move {
            let scope = Scope::from_token(shutdown.child_token());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(target: "conduit::cascade", "cascade processor shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(this.interval) => {
                        if let Err(err) = this.process_pending(&scope).await {
                            warn!(target: "conduit::cascade", error = %err, "cascade sweep failed");
                        }
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            let Some(root_id) = event.meta.cascade_root_id else { continue };
                            if event.payload.terminal_state().is_none() {
                                continue;
                            }
                            if let Err(err) = this.process_tree(&scope, root_id).await {
                                warn!(target: "conduit::cascade", %root_id, error = %err, "cascade pass failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(target: "conduit::cascade", skipped, "cascade processor lagged behind events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!(target: "conduit::cascade", "event stream closed");
                            break;
                        }
                    },
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.lock().await.take()
            && let Err(err) = handle.await
        {
            warn!(target: "conduit::cascade", "cascade processor task failed: {err:?}");
        }
    }
}
