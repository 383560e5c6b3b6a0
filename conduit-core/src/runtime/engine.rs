//! Process-level supervisor for the operation engine.
//!
//! [`Engine`] owns every long-lived component: the scheduler and its runner,
//! the standalone worker pool, the maintainer, the cascade processor and the
//! event bus. It is the entry point for callers that want to run jobs,
//! provision instances, start cascade deletes or wait on an operation.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use conduit_model::{
    EngineConfig, Operation, OperationCategory, OperationId, OperationState,
    Resource, ResourceType, ServiceInstance, Tenant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event_bus::{InProcOperationEventBus, OperationNotification};
use crate::{
    backend::BackendRegistry,
    cascade::{CascadeProcessor, CascadeTreeBuilder, CascadedOperations},
    error::{EngineError, Result},
    events::{OperationEvent, OperationEventPublisher},
    operations::{
        ActiveOperations, DeleteJob, Job, JobQueue, JobRunner, OperationMaintainer,
        OperationResumer, ProvisionInstanceJob, Scheduler, WorkerPool, state,
    },
    scope::Scope,
    store::{
        Criterion, ObjectType, OperationStore, Repository,
        interceptor::{CatalogInterceptor, InterceptableRepository},
        memory::InMemoryRepository,
    },
};

pub struct EngineBuilder {
    config: EngineConfig,
    repo: Option<Arc<dyn Repository>>,
    backends: BackendRegistry,
    events: Option<Arc<InProcOperationEventBus>>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("repo_set", &self.repo.is_some())
            .field("backends", &self.backends)
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            repo: None,
            backends: BackendRegistry::new(),
            events: None,
        }
    }

    /// Storage for operations and resources. Defaults to an in-memory
    /// repository with catalog synchronisation for brokers.
    pub fn with_repository(mut self, repo: Arc<dyn Repository>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<InProcOperationEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let pool_size = self.config.pool.pool_size;
        if pool_size == 0 {
            return Err(EngineError::Validation(
                "pool size must be greater than zero".into(),
            ));
        }
        let ops = &self.config.operations;

        let repo = self.repo.unwrap_or_else(default_repository);
        let events = self.events.unwrap_or_default();
        let publisher: Arc<dyn OperationEventPublisher> = events.clone();

        let root = CancellationToken::new();
        let jobs = root.child_token();

        let active = Arc::new(ActiveOperations::new());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&repo),
            Arc::clone(&publisher),
            ops.job_timeout(),
            jobs.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&repo),
            Arc::clone(&runner),
            Arc::clone(&active),
            pool_size,
            jobs.clone(),
            ops.shutdown_grace(),
        ));
        let (worker_pool, queue) = WorkerPool::new(
            pool_size,
            self.config.pool.queue_capacity,
            Arc::clone(&repo),
            Arc::clone(&runner),
            active,
            jobs.clone(),
            ops.shutdown_grace(),
        );

        let resumer = Arc::new(EngineResumer {
            repo: Arc::clone(&repo),
            scheduler: Arc::clone(&scheduler),
            backends: self.backends.clone(),
            config: self.config.clone(),
        });
        let maintainer = Arc::new(
            OperationMaintainer::new(Arc::clone(&repo), ops.clone(), root.child_token())
                .with_resumer(resumer),
        );
        let cascade = Arc::new(CascadeProcessor::new(
            Arc::clone(&repo),
            Arc::clone(&scheduler),
            self.backends.clone(),
            Arc::clone(&publisher),
            self.config.cascade.polling_interval(),
            root.child_token(),
        )
        .with_max_polling_duration(ops.max_polling_duration()));
        let builder = CascadeTreeBuilder::new(Arc::clone(&repo));

        Ok(Engine {
            config: self.config,
            root,
            repo,
            events,
            backends: self.backends,
            scheduler,
            worker_pool,
            queue,
            maintainer,
            cascade,
            builder,
        })
    }
}

fn default_repository() -> Arc<dyn Repository> {
    let memory: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    Arc::new(
        InterceptableRepository::new(memory).with_interceptor(Arc::new(CatalogInterceptor)),
    )
}

pub struct Engine {
    config: EngineConfig,
    root: CancellationToken,
    repo: Arc<dyn Repository>,
    events: Arc<InProcOperationEventBus>,
    backends: BackendRegistry,
    scheduler: Arc<Scheduler>,
    worker_pool: WorkerPool,
    queue: JobQueue,
    maintainer: Arc<OperationMaintainer>,
    cascade: Arc<CascadeProcessor>,
    builder: CascadeTreeBuilder,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("worker_pool", &self.worker_pool)
            .field("maintainer", &self.maintainer)
            .field("cascade", &self.cascade)
            .field("shutdown", &self.root.is_cancelled())
            .finish()
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Starts the background components.
    pub async fn start(&self) {
        self.maintainer.start().await;
        self.worker_pool.start().await;
        self.cascade.start(self.events.subscribe()).await;
        info!(
            target: "conduit::engine",
            pool_size = self.config.pool.pool_size,
            "operation engine started"
        );
    }

    /// Stops background sweeps, cancels running jobs and waits for them up to
    /// the configured grace period.
    pub async fn shutdown(&self) {
        self.maintainer.shutdown().await;
        self.cascade.shutdown().await;
        self.scheduler.shutdown().await;
        self.worker_pool.shutdown().await;
        self.root.cancel();
        info!(target: "conduit::engine", "operation engine stopped");
    }

    /// Root scope of the engine; cancelled on shutdown.
    pub fn scope(&self) -> Scope {
        Scope::from_token(self.root.child_token())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn events(&self) -> &Arc<InProcOperationEventBus> {
        &self.events
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn maintainer(&self) -> &Arc<OperationMaintainer> {
        &self.maintainer
    }

    pub fn cascade(&self) -> &Arc<CascadeProcessor> {
        &self.cascade
    }

    /// Runs `job` in one of the scheduler's slots. Fails fast with
    /// [`EngineError::Busy`] when none is free.
    pub async fn schedule(&self, scope: &Scope, job: Box<dyn Job>) -> Result<OperationId> {
        self.scheduler.schedule(scope, job).await
    }

    /// Hands `job` to the standalone worker pool.
    pub fn submit(&self, scope: &Scope, job: Box<dyn Job>) -> Result<OperationId> {
        self.queue.try_submit(scope, job)
    }

    /// Schedules `job` and waits for its operation to finish or for the
    /// notification timeout.
    pub async fn schedule_and_wait(
        &self,
        scope: &Scope,
        job: Box<dyn Job>,
    ) -> Result<OperationNotification> {
        let operation_id = job.operation().id;
        let waiter = self
            .events
            .register(scope, operation_id, self.config.operations.notification_timeout())
            .await;
        self.scheduler.schedule(scope, job).await?;
        waiter
            .await
            .map_err(|_| EngineError::Internal("operation waiter dropped".into()))
    }

    /// Waits for an already scheduled operation to finish.
    pub async fn wait_for(
        &self,
        scope: &Scope,
        operation_id: OperationId,
    ) -> Result<OperationNotification> {
        let waiter = self
            .events
            .register(scope, operation_id, self.config.operations.notification_timeout())
            .await;
        let current = self.repo.get_operation(scope, operation_id).await?;
        if current.is_terminal() {
            return Ok(OperationNotification::Finished(current.state));
        }
        waiter
            .await
            .map_err(|_| EngineError::Internal("operation waiter dropped".into()))
    }

    /// Schedules provisioning of `instance` under `operation`.
    pub async fn provision_instance(
        &self,
        scope: &Scope,
        operation: Operation,
        instance: ServiceInstance,
    ) -> Result<OperationId> {
        let backend = self.backends.get(ResourceType::Instance).ok_or_else(|| {
            EngineError::Validation("no backend registered for instances".into())
        })?;
        let job = provision_job(&self.config, operation, instance, backend);
        self.scheduler.schedule(scope, Box::new(job)).await
    }

    /// Starts a cascade delete of `resource` and returns the root operation id.
    ///
    /// The whole tree is built and stored before anything runs; the cascade
    /// processor leaves it alone until then. If building or storing it fails,
    /// the operations already stored are removed and the root operation is
    /// failed with the error.
    pub async fn delete_cascade(&self, scope: &Scope, resource: Resource) -> Result<OperationId> {
        let mut root = Operation::new_cascade_root(resource.id(), resource.resource_type());
        if let Some(current) = scope.operation() {
            root.correlation_id = current.correlation_id.clone();
        }
        if let Resource::Platform(platform) = &resource {
            root.platform_id = Some(platform.id.clone());
        }
        let root = self.repo.create_operation(scope, root).await?;
        info!(
            target: "conduit::cascade",
            operation_id = %root.id,
            resource_type = %root.resource_type,
            resource_id = %root.resource_id,
            "cascade delete requested"
        );

        self.cascade.hold(root.id).await;
        let stored = self.store_tree(scope, &root, resource).await;
        self.cascade.release(root.id).await;
        if let Err(err) = stored {
            return Err(self.fail_root(scope, root, err).await);
        }
        self.cascade.process_tree(scope, root.id).await?;
        Ok(root.id)
    }

    /// Cascade delete of everything labelled as belonging to `tenant_id`.
    pub async fn delete_tenant(&self, scope: &Scope, tenant_id: &str) -> Result<OperationId> {
        let tenant = Tenant::new(tenant_id, self.config.cascade.tenant_label_key.as_str());
        self.delete_cascade(scope, Resource::Tenant(tenant)).await
    }

    async fn store_tree(&self, scope: &Scope, root: &Operation, resource: Resource) -> Result<()> {
        let tree = self.builder.build(scope, root, resource).await?;
        let mut stored = Vec::with_capacity(tree.len());
        for operation in tree {
            let operation_id = operation.id;
            if let Err(err) = self.repo.create_operation(scope, operation).await {
                return Err(self.discard_partial_tree(scope, root.id, &stored, err).await);
            }
            stored.push(operation_id);
        }
        Ok(())
    }

    async fn discard_partial_tree(
        &self,
        scope: &Scope,
        root_id: OperationId,
        stored: &[OperationId],
        err: EngineError,
    ) -> EngineError {
        if stored.is_empty() {
            return err;
        }
        let criteria = [Criterion::is_in("id", stored.iter().copied())];
        match self.repo.delete(scope, ObjectType::Operation, &criteria).await {
            Ok(removed) => {
                debug!(
                    target: "conduit::cascade",
                    %root_id,
                    removed = removed.len(),
                    "discarded partially stored cascade tree"
                );
                err
            }
            Err(cleanup_err) => EngineError::compound(err, cleanup_err),
        }
    }

    async fn fail_root(&self, scope: &Scope, mut root: Operation, err: EngineError) -> EngineError {
        warn!(
            target: "conduit::cascade",
            operation_id = %root.id,
            error = %err,
            "cascade tree could not be built"
        );
        root.errors = Some(err.to_payload());
        let failed = state::transition(&mut root, OperationState::InProgress)
            .and_then(|_| state::transition(&mut root, OperationState::Failed));
        if let Err(transition_err) = failed {
            return EngineError::compound(err, transition_err);
        }
        match self.repo.update_operation(scope, root).await {
            Ok(stored) => {
                if let Err(publish_err) = self.events.publish(OperationEvent::settled(&stored)).await {
                    debug!(target: "conduit::cascade", error = %publish_err, "failed to publish");
                }
                err
            }
            Err(store_err) => EngineError::compound(err, store_err),
        }
    }

    /// Roll-up of the direct children of `parent_id`.
    pub async fn cascaded_operations(
        &self,
        scope: &Scope,
        parent_id: OperationId,
    ) -> Result<CascadedOperations> {
        CascadedOperations::for_parent(self.repo.as_ref(), scope, parent_id).await
    }
}

fn provision_job(
    config: &EngineConfig,
    operation: Operation,
    instance: ServiceInstance,
    backend: Arc<dyn crate::backend::BackendExecutor>,
) -> ProvisionInstanceJob {
    ProvisionInstanceJob::new(operation, instance, backend)
        .with_orphan_mitigation_grace(config.operations.orphan_mitigation_grace())
        .with_max_polling_duration(config.operations.max_polling_duration())
}

/// Rebuilds the job behind a stored operation and schedules it again.
struct EngineResumer {
    repo: Arc<dyn Repository>,
    scheduler: Arc<Scheduler>,
    backends: BackendRegistry,
    config: EngineConfig,
}

#[async_trait]
impl OperationResumer for EngineResumer {
    async fn resume(&self, scope: &Scope, operation: Operation) -> Result<()> {
        let job: Box<dyn Job> = match (operation.category, operation.resource_type) {
            (OperationCategory::Create, ResourceType::Instance) => {
                let Some(backend) = self.backends.get(ResourceType::Instance) else {
                    debug!(target: "conduit::maintainer", operation_id = %operation.id, "no instance backend");
                    return Ok(());
                };
                let instance = match self
                    .repo
                    .get_resource(scope, ResourceType::Instance, &operation.resource_id)
                    .await
                {
                    Ok(Resource::Instance(instance)) => instance,
                    Ok(_) | Err(EngineError::NotFound(_)) => {
                        debug!(
                            target: "conduit::maintainer",
                            operation_id = %operation.id,
                            resource_id = %operation.resource_id,
                            "instance record missing; nothing to resume"
                        );
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                };
                Box::new(provision_job(&self.config, operation, instance, backend))
            }
            (OperationCategory::Delete, resource_type) => {
                let mut job = DeleteJob::for_operation(operation)
                    .with_max_polling_duration(self.config.operations.max_polling_duration());
                if let Some(backend) = self.backends.get(resource_type) {
                    job = job.with_backend(backend);
                }
                Box::new(job)
            }
            _ => {
                debug!(
                    target: "conduit::maintainer",
                    operation_id = %operation.id,
                    category = %operation.category,
                    "operation kind cannot be resumed"
                );
                return Ok(());
            }
        };
        self.scheduler.schedule(scope, job).await.map(|_| ())
    }
}

impl fmt::Debug for EngineResumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineResumer")
            .field("backends", &self.backends)
            .finish()
    }
}
