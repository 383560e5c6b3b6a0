mod common;

use std::{sync::Arc, sync::atomic::Ordering, time::Duration};

use common::{
    BlockingJob, FailingJob, FlakyRepository, HangingJob, test_config, wait_terminal,
};
use conduit_core::{
    BackendError, Engine, EngineError, InProcOperationEventBus, OperationNotification,
    OperationStore, Repository, Scope, UpdateJob,
    operations::JobRunner,
    store::memory::InMemoryRepository,
};
use conduit_model::{Operation, OperationCategory, OperationState, ResourceType, ServicePlan};
use tokio_util::sync::CancellationToken;

fn update_op(resource_id: &str) -> Operation {
    Operation::new(resource_id, ResourceType::Plan, OperationCategory::Update)
}

async fn wait_for_free_slots(engine: &Engine, expected: usize) {
    for _ in 0..500 {
        if engine.scheduler().available_slots() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("slots were not released");
}

#[tokio::test]
async fn admission_beyond_the_pool_is_rejected_without_persisting() {
    let engine = Engine::builder(test_config(2)).build().unwrap();
    let scope = engine.scope();

    let first = BlockingJob::new(update_op("p1"));
    let second = BlockingJob::sharing(update_op("p2"), &first);
    let started = Arc::clone(&first.started);
    let release = Arc::clone(&first.release);
    let first_id = engine.schedule(&scope, Box::new(first)).await.unwrap();
    let second_id = engine.schedule(&scope, Box::new(second)).await.unwrap();

    let rejected = update_op("p3");
    let rejected_id = rejected.id;
    let err = engine
        .schedule(&scope, Box::new(BlockingJob::new(rejected)))
        .await
        .unwrap_err();
    assert!(err.is_busy(), "got {err:?}");
    assert!(
        engine
            .repository()
            .get_operation(&scope, rejected_id)
            .await
            .unwrap_err()
            .is_not_found()
    );

    while started.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }
    release.notify_waiters();

    let repo = engine.repository().as_ref();
    assert_eq!(wait_terminal(repo, first_id).await.state, OperationState::Succeeded);
    assert_eq!(wait_terminal(repo, second_id).await.state, OperationState::Succeeded);
    wait_for_free_slots(&engine, 2).await;

    let plan = ServicePlan::new("p9", "small", "o1");
    let op = Operation::new("p9", ResourceType::Plan, OperationCategory::Create);
    let id = engine
        .schedule(
            &scope,
            Box::new(conduit_core::CreateJob::new(op, conduit_model::Resource::Plan(plan))),
        )
        .await
        .unwrap();
    assert_eq!(wait_terminal(repo, id).await.state, OperationState::Succeeded);
}

#[tokio::test]
async fn operation_that_cannot_be_stored_never_runs() {
    let flaky = FlakyRepository::new(Arc::new(InMemoryRepository::new()));
    flaky.fail_creates();
    let engine = Engine::builder(test_config(1))
        .with_repository(flaky)
        .build()
        .unwrap();
    let scope = engine.scope();

    let job = BlockingJob::new(update_op("p1"));
    let started = Arc::clone(&job.started);
    let err = engine.schedule(&scope, Box::new(job)).await.unwrap_err();
    assert!(matches!(err, EngineError::Internal(_)), "got {err:?}");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert_eq!(engine.scheduler().available_slots(), 1);
}

#[tokio::test]
async fn same_operation_is_not_admitted_twice() {
    let engine = Engine::builder(test_config(4)).build().unwrap();
    let scope = engine.scope();
    let op = update_op("p1");

    let job = BlockingJob::new(op.clone());
    let release = Arc::clone(&job.release);
    let started = Arc::clone(&job.started);
    engine.schedule(&scope, Box::new(job)).await.unwrap();

    let err = engine
        .schedule(&scope, Box::new(BlockingJob::new(op.clone())))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)), "got {err:?}");

    while started.load(Ordering::SeqCst) < 1 {
        tokio::task::yield_now().await;
    }
    release.notify_waiters();
    wait_terminal(engine.repository().as_ref(), op.id).await;
}

#[tokio::test]
async fn worker_pool_does_not_run_an_operation_a_slot_owns() {
    let engine = Engine::builder(test_config(2)).build().unwrap();
    engine.start().await;
    let scope = engine.scope();
    let op = update_op("p1");

    let job = BlockingJob::new(op.clone());
    let twin = BlockingJob::sharing(op.clone(), &job);
    let started = Arc::clone(&job.started);
    let release = Arc::clone(&job.release);
    engine.schedule(&scope, Box::new(job)).await.unwrap();
    while started.load(Ordering::SeqCst) < 1 {
        tokio::task::yield_now().await;
    }

    engine.submit(&scope, Box::new(twin)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    release.notify_waiters();
    let done = wait_terminal(engine.repository().as_ref(), op.id).await;
    assert_eq!(done.state, OperationState::Succeeded);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn job_past_its_deadline_fails_with_timeout() {
    let mut config = test_config(1);
    config.operations.job_timeout_secs = 300;
    let engine = Engine::builder(config).build().unwrap();
    let scope = engine.scope();

    let op = update_op("p1");
    let id = engine.schedule(&scope, Box::new(HangingJob(op))).await.unwrap();
    wait_for_operation_state(&engine, id, OperationState::InProgress).await;
    tokio::time::advance(Duration::from_secs(301)).await;

    let failed = wait_terminal(engine.repository().as_ref(), id).await;
    assert_eq!(failed.state, OperationState::Failed);
    let errors = failed.errors.unwrap();
    assert_eq!(errors["error"], "Timeout");
}

#[tokio::test]
async fn failure_to_record_a_failure_is_compounded() {
    let flaky = FlakyRepository::new(Arc::new(InMemoryRepository::new()));
    let repo: Arc<dyn Repository> = flaky.clone();
    let scope = Scope::root();
    let op = update_op("p1");
    repo.create_operation(&scope, op.clone()).await.unwrap();
    // The IN_PROGRESS write succeeds, the FAILED write does not.
    flaky.fail_updates_after(1);

    let runner = JobRunner::new(
        Arc::clone(&repo),
        Arc::new(InProcOperationEventBus::default()),
        Duration::from_secs(60),
        CancellationToken::new(),
    );
    let err = runner
        .run(
            scope.clone(),
            Box::new(FailingJob(op.clone(), BackendError::new("broker exploded"))),
        )
        .await
        .unwrap_err();

    let EngineError::Compound { primary, secondary } = err else {
        panic!("expected a compound error");
    };
    assert!(matches!(*primary, EngineError::Backend(_)));
    assert!(matches!(*secondary, EngineError::Internal(_)));
    assert_eq!(
        repo.get_operation(&scope, op.id).await.unwrap().state,
        OperationState::InProgress
    );
}

#[tokio::test]
async fn terminal_operations_do_not_run_again() {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let scope = Scope::root();
    let mut op = update_op("p1");
    op.state = OperationState::Succeeded;
    repo.create_operation(&scope, op.clone()).await.unwrap();

    let runner = JobRunner::new(
        Arc::clone(&repo),
        Arc::new(InProcOperationEventBus::default()),
        Duration::from_secs(60),
        CancellationToken::new(),
    );
    let job = BlockingJob::new(op.clone());
    let started = Arc::clone(&job.started);
    let err = runner.run(scope.clone(), Box::new(job)).await.unwrap_err();

    assert!(matches!(err, EngineError::InvalidTransition { .. }), "got {err:?}");
    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert_eq!(
        repo.get_operation(&scope, op.id).await.unwrap().state,
        OperationState::Succeeded
    );
}

#[tokio::test]
async fn shutdown_cancels_running_jobs_and_stops_admission() {
    let engine = Engine::builder(test_config(2)).build().unwrap();
    engine.start().await;
    let scope = Scope::root();

    let id = engine
        .schedule(&scope, Box::new(HangingJob(update_op("p1"))))
        .await
        .unwrap();
    wait_for_operation_state(&engine, id, OperationState::InProgress).await;

    engine.shutdown().await;

    let stopped = engine
        .repository()
        .get_operation(&scope, id)
        .await
        .unwrap();
    assert_eq!(stopped.state, OperationState::Failed);
    assert_eq!(stopped.errors.unwrap()["error"], "Cancelled");

    let err = engine
        .schedule(&scope, Box::new(HangingJob(update_op("p2"))))
        .await
        .unwrap_err();
    assert!(err.is_busy());
}

async fn wait_for_operation_state(
    engine: &Engine,
    id: conduit_model::OperationId,
    state: OperationState,
) {
    common::wait_for_operation(engine.repository().as_ref(), id, |op| op.state == state).await;
}

#[tokio::test]
async fn worker_pool_runs_submitted_jobs_and_rejects_overflow() {
    let mut config = test_config(1);
    config.pool.queue_capacity = 1;
    let engine = Engine::builder(config).build().unwrap();
    let scope = engine.scope();

    let plan = conduit_model::Resource::Plan(ServicePlan::new("p1", "small", "o1"));
    let create = Operation::new("p1", ResourceType::Plan, OperationCategory::Create);
    let id = engine
        .submit(&scope, Box::new(conduit_core::CreateJob::new(create, plan.clone())))
        .unwrap();

    // Nothing consumes the queue yet.
    let err = engine
        .submit(&scope, Box::new(UpdateJob::new(update_op("p1"), plan)))
        .unwrap_err();
    assert!(err.is_busy(), "got {err:?}");

    engine.start().await;
    let done = wait_terminal(engine.repository().as_ref(), id).await;
    assert_eq!(done.state, OperationState::Succeeded);
    engine.shutdown().await;
}

#[tokio::test]
async fn schedule_and_wait_reports_the_terminal_state() {
    let engine = Engine::builder(test_config(1)).build().unwrap();
    let scope = engine.scope();
    let op = update_op("p1");

    let notification = engine
        .schedule_and_wait(
            &scope,
            Box::new(FailingJob(op, BackendError::new("nope").with_status(502))),
        )
        .await
        .unwrap();
    assert_eq!(notification, OperationNotification::Finished(OperationState::Failed));
}
