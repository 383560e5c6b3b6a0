#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use conduit_core::{
    BackendError, BackendExecutor, DeprovisionOutcome, EngineError, Job, JobOutcome,
    PollOutcome, ProvisionOutcome, Repository, Result, Scope,
    operations::JobKind,
    store::{Criterion, Object, ObjectType, OperationStore},
};
use conduit_model::{EngineConfig, Operation, OperationId, Resource};

/// Configurable backend that counts every call.
#[derive(Debug, Default)]
pub struct FakeBackend {
    pub provisions: AtomicUsize,
    pub polls: AtomicUsize,
    pub deprovisions: AtomicUsize,
    failing_deletes: Mutex<HashSet<String>>,
    provision_error: Mutex<Option<BackendError>>,
    failing_deprovisions: AtomicUsize,
    async_deprovision: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_delete_of(&self, id: &str) {
        self.failing_deletes.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_provision_with(&self, err: BackendError) {
        *self.provision_error.lock().unwrap() = Some(err);
    }

    /// The next `n` deprovisions fail regardless of the resource.
    pub fn fail_next_deprovisions(&self, n: usize) {
        self.failing_deprovisions.store(n, Ordering::SeqCst);
    }

    pub fn deprovision_async(&self) {
        self.async_deprovision.store(true, Ordering::SeqCst);
    }

    pub fn deprovision_count(&self) -> usize {
        self.deprovisions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendExecutor for FakeBackend {
    async fn provision(
        &self,
        _scope: &Scope,
        _resource: &Resource,
    ) -> std::result::Result<ProvisionOutcome, BackendError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        match self.provision_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(ProvisionOutcome::Sync {
                dashboard_url: None,
            }),
        }
    }

    async fn poll(
        &self,
        _scope: &Scope,
        _resource: &Resource,
        _poll_handle: Option<String>,
    ) -> std::result::Result<PollOutcome, BackendError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(PollOutcome::Completed)
    }

    async fn deprovision(
        &self,
        _scope: &Scope,
        resource: &Resource,
    ) -> std::result::Result<DeprovisionOutcome, BackendError> {
        self.deprovisions.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_deprovisions.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_deprovisions.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::new("backend unavailable").with_status(503));
        }
        if self.failing_deletes.lock().unwrap().contains(resource.id()) {
            return Err(BackendError::new(format!("cannot delete {}", resource.id())));
        }
        if self.async_deprovision.load(Ordering::SeqCst) {
            return Ok(DeprovisionOutcome::Async {
                poll_handle: Some(format!("deprov-{}", resource.id())),
            });
        }
        Ok(DeprovisionOutcome::Sync)
    }
}

/// Job that parks until released, counting how often it started.
#[derive(Debug)]
pub struct BlockingJob {
    operation: Operation,
    pub started: Arc<AtomicUsize>,
    pub release: Arc<tokio::sync::Notify>,
}

impl BlockingJob {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            started: Arc::new(AtomicUsize::new(0)),
            release: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn sharing(operation: Operation, other: &BlockingJob) -> Self {
        Self {
            operation,
            started: Arc::clone(&other.started),
            release: Arc::clone(&other.release),
        }
    }
}

#[async_trait]
impl Job for BlockingJob {
    fn kind(&self) -> JobKind {
        JobKind::Update
    }

    fn operation(&self) -> &Operation {
        &self.operation
    }

    async fn execute(
        &self,
        _scope: &Scope,
        _operation: &mut Operation,
        _repo: &dyn Repository,
    ) -> Result<JobOutcome> {
        let released = self.release.notified();
        self.started.fetch_add(1, Ordering::SeqCst);
        released.await;
        Ok(JobOutcome::Completed(None))
    }
}

/// Job that never finishes on its own.
#[derive(Debug)]
pub struct HangingJob(pub Operation);

#[async_trait]
impl Job for HangingJob {
    fn kind(&self) -> JobKind {
        JobKind::Update
    }

    fn operation(&self) -> &Operation {
        &self.0
    }

    async fn execute(
        &self,
        _scope: &Scope,
        _operation: &mut Operation,
        _repo: &dyn Repository,
    ) -> Result<JobOutcome> {
        futures::future::pending::<()>().await;
        Ok(JobOutcome::Pending)
    }
}

/// Job that fails with the given backend error.
#[derive(Debug)]
pub struct FailingJob(pub Operation, pub BackendError);

#[async_trait]
impl Job for FailingJob {
    fn kind(&self) -> JobKind {
        JobKind::Update
    }

    fn operation(&self) -> &Operation {
        &self.0
    }

    async fn execute(
        &self,
        _scope: &Scope,
        _operation: &mut Operation,
        _repo: &dyn Repository,
    ) -> Result<JobOutcome> {
        Err(EngineError::Backend(self.1.clone()))
    }
}

/// Repository wrapper whose writes can be switched to fail.
pub struct FlakyRepository {
    inner: Arc<dyn Repository>,
    fail_creates: AtomicBool,
    /// Creates fail once this many have succeeded.
    creates_before_failure: AtomicUsize,
    /// Updates fail once this many have succeeded.
    updates_before_failure: AtomicUsize,
    fail_updates: AtomicBool,
}

impl FlakyRepository {
    pub fn new(inner: Arc<dyn Repository>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_creates: AtomicBool::new(false),
            creates_before_failure: AtomicUsize::new(0),
            updates_before_failure: AtomicUsize::new(0),
            fail_updates: AtomicBool::new(false),
        })
    }

    pub fn fail_creates(&self) {
        self.fail_creates_after(0);
    }

    pub fn fail_creates_after(&self, successes: usize) {
        self.creates_before_failure.store(successes, Ordering::SeqCst);
        self.fail_creates.store(true, Ordering::SeqCst);
    }

    pub fn fail_updates_after(&self, successes: usize) {
        self.updates_before_failure.store(successes, Ordering::SeqCst);
        self.fail_updates.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn create(&self, scope: &Scope, object: Object) -> Result<Object> {
        if self.fail_creates.load(Ordering::SeqCst) {
            let left = self.creates_before_failure.load(Ordering::SeqCst);
            if left == 0 {
                return Err(EngineError::Internal("store unavailable".into()));
            }
            self.creates_before_failure.store(left - 1, Ordering::SeqCst);
        }
        self.inner.create(scope, object).await
    }

    async fn update(&self, scope: &Scope, object: Object) -> Result<Object> {
        if self.fail_updates.load(Ordering::SeqCst) {
            let left = self.updates_before_failure.load(Ordering::SeqCst);
            if left == 0 {
                return Err(EngineError::Internal("store unavailable".into()));
            }
            self.updates_before_failure.store(left - 1, Ordering::SeqCst);
        }
        self.inner.update(scope, object).await
    }

    async fn delete(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Object>> {
        self.inner.delete(scope, object_type, criteria).await
    }

    async fn get(&self, scope: &Scope, object_type: ObjectType, id: &str) -> Result<Object> {
        self.inner.get(scope, object_type, id).await
    }

    async fn list(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Object>> {
        self.inner.list(scope, object_type, criteria).await
    }
}

pub fn test_config(pool_size: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pool.pool_size = pool_size;
    config.operations.shutdown_grace_secs = 1;
    config.operations.notification_timeout_secs = 5;
    config.cascade.polling_interval_ms = 50;
    config
}

/// Polls the stored operation until `done` holds, for up to five seconds.
pub async fn wait_for_operation(
    repo: &dyn Repository,
    id: OperationId,
    done: impl Fn(&Operation) -> bool,
) -> Operation {
    let scope = Scope::root();
    for _ in 0..500 {
        if let Ok(op) = repo.get_operation(&scope, id).await
            && done(&op)
        {
            return op;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let current = repo.get_operation(&scope, id).await;
    panic!("operation {id} did not settle: {current:?}");
}

pub async fn wait_terminal(repo: &dyn Repository, id: OperationId) -> Operation {
    wait_for_operation(repo, id, Operation::is_terminal).await
}

/// Waits until no scheduled job is still running.
pub async fn settle(engine: &conduit_core::Engine) {
    for _ in 0..500 {
        if engine.scheduler().running() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scheduled jobs did not finish");
}
