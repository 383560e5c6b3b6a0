mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{FakeBackend, settle, test_config, wait_for_operation};
use conduit_core::{
    BackendError, BackendRegistry, Engine, OperationMaintainer, OperationStore, Repository,
    Scope, store::memory::InMemoryRepository,
};
use conduit_model::{
    Operation, OperationCategory, OperationState, OperationsConfig, ResourceType,
    ServiceInstance,
};
use tokio_util::sync::CancellationToken;

fn maintainer(repo: &Arc<dyn Repository>, config: OperationsConfig) -> OperationMaintainer {
    OperationMaintainer::new(Arc::clone(repo), config, CancellationToken::new())
}

fn aged(resource_id: &str, state: OperationState, age: Duration) -> Operation {
    let mut op = Operation::new(resource_id, ResourceType::Instance, OperationCategory::Create);
    op.state = state;
    op.created_at = Utc::now() - age;
    op.updated_at = op.created_at;
    op
}

async fn stored(repo: &Arc<dyn Repository>) -> Vec<Operation> {
    repo.list_operations(&Scope::root(), &[]).await.unwrap()
}

#[tokio::test]
async fn retention_removes_every_expired_operation() {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let scope = Scope::root();
    let recent = aged("i2", OperationState::Succeeded, Duration::hours(1));
    for op in [
        aged("i1", OperationState::Succeeded, Duration::days(3)),
        aged("i1", OperationState::Failed, Duration::days(2)),
        recent.clone(),
    ] {
        repo.create_operation(&scope, op).await.unwrap();
    }

    let deleted = maintainer(&repo, OperationsConfig::default())
        .cleanup_old_operations(Utc::now())
        .await
        .unwrap();

    assert_eq!(deleted, 2);
    let left = stored(&repo).await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, recent.id);
}

#[tokio::test]
async fn retention_can_keep_the_latest_operation_per_resource() {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let scope = Scope::root();
    let oldest = aged("i1", OperationState::Succeeded, Duration::days(3));
    let latest = aged("i1", OperationState::Failed, Duration::days(2));
    let only = aged("i3", OperationState::Succeeded, Duration::days(5));
    for op in [oldest.clone(), latest.clone(), only.clone()] {
        repo.create_operation(&scope, op).await.unwrap();
    }

    let config = OperationsConfig {
        keep_latest_per_resource: true,
        ..OperationsConfig::default()
    };
    let deleted = maintainer(&repo, config)
        .cleanup_old_operations(Utc::now())
        .await
        .unwrap();

    assert_eq!(deleted, 1);
    let mut left: Vec<_> = stored(&repo).await.into_iter().map(|op| op.id).collect();
    left.sort();
    let mut expected = vec![latest.id, only.id];
    expected.sort();
    assert_eq!(left, expected);
}

#[tokio::test]
async fn stuck_operations_are_removed_but_polling_ones_are_left_alone() {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let scope = Scope::root();
    let config = OperationsConfig::default();
    let timeout = Duration::seconds(config.job_timeout_secs as i64);
    let stuck = aged(
        "i1",
        OperationState::InProgress,
        timeout + Duration::seconds(1),
    );
    let mut polling = aged("i2", OperationState::InProgress, Duration::hours(2));
    polling.reschedule = true;
    let fresh = aged("i3", OperationState::InProgress, Duration::minutes(5));
    let finished = aged("i4", OperationState::Succeeded, Duration::hours(2));
    for op in [stuck.clone(), polling.clone(), fresh.clone(), finished.clone()] {
        repo.create_operation(&scope, op).await.unwrap();
    }

    let removed = maintainer(&repo, config)
        .cleanup_stuck_operations(Utc::now())
        .await
        .unwrap();
    assert_eq!(removed, 1);

    assert!(
        repo.get_operation(&scope, stuck.id)
            .await
            .unwrap_err()
            .is_not_found()
    );
    let mut left: Vec<_> = stored(&repo).await.into_iter().map(|op| op.id).collect();
    left.sort();
    let mut expected = vec![polling.id, fresh.id, finished.id];
    expected.sort();
    assert_eq!(left, expected);
}

#[tokio::test]
async fn orphan_mitigation_reuses_one_operation_until_it_completes() {
    let backend = FakeBackend::new();
    backend.fail_provision_with(
        BackendError::new("broker timed out").requiring_orphan_mitigation(),
    );
    backend.fail_next_deprovisions(1);
    let engine = Engine::builder(test_config(2))
        .with_backends(BackendRegistry::new().with(ResourceType::Instance, backend.clone()))
        .build()
        .unwrap();
    let repo = Arc::clone(engine.repository());
    let scope = Scope::root();

    let op = Operation::new("i1", ResourceType::Instance, OperationCategory::Create);
    let id = engine
        .provision_instance(&scope, op, ServiceInstance::new("i1", "p1", "cf"))
        .await
        .unwrap();
    let first = wait_for_operation(repo.as_ref(), id, Operation::is_terminal).await;
    assert_eq!(first.state, OperationState::Failed);
    let scheduled_at = first.deletion_scheduled.expect("mitigation scheduled");
    settle(&engine).await;

    // Mitigation attempt fails: same record, same episode.
    assert_eq!(engine.maintainer().resume_operations(Utc::now()).await.unwrap(), 1);
    let second = wait_for_operation(repo.as_ref(), id, |op| {
        op.is_terminal() && op.updated_at > first.updated_at
    })
    .await;
    assert_eq!(second.state, OperationState::Failed);
    assert_eq!(second.deletion_scheduled, Some(scheduled_at));
    assert_eq!(second.errors.as_ref().unwrap()["status_code"], 503);
    assert_eq!(stored(&repo).await.len(), 1);
    settle(&engine).await;

    // Mitigation succeeds.
    assert_eq!(engine.maintainer().resume_operations(Utc::now()).await.unwrap(), 1);
    let third = wait_for_operation(repo.as_ref(), id, |op| {
        op.is_terminal() && op.updated_at > second.updated_at
    })
    .await;
    assert_eq!(third.state, OperationState::Failed);
    assert!(third.deletion_scheduled.is_none());
    assert_eq!(backend.deprovision_count(), 2);
    assert!(
        repo.get_resource(&scope, ResourceType::Instance, "i1")
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert_eq!(stored(&repo).await.len(), 1);
    settle(&engine).await;

    // Nothing left to resume.
    assert_eq!(engine.maintainer().resume_operations(Utc::now()).await.unwrap(), 0);
    assert_eq!(backend.provisions.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rescheduled_delete_is_polled_to_completion() {
    let backend = FakeBackend::new();
    backend.deprovision_async();
    let engine = Engine::builder(test_config(2))
        .with_backends(BackendRegistry::new().with(ResourceType::Instance, backend.clone()))
        .build()
        .unwrap();
    let repo = Arc::clone(engine.repository());
    let scope = Scope::root();
    repo.create(
        &scope,
        conduit_model::Resource::Instance(ServiceInstance::new("i1", "p1", "cf")).into(),
    )
    .await
    .unwrap();

    let op = Operation::new("i1", ResourceType::Instance, OperationCategory::Delete);
    let id = engine
        .schedule(
            &scope,
            Box::new(conduit_core::DeleteJob::for_operation(op).with_backend(backend.clone())),
        )
        .await
        .unwrap();
    let waiting = wait_for_operation(repo.as_ref(), id, |op| {
        op.state == OperationState::InProgress && op.reschedule
    })
    .await;
    assert_eq!(waiting.external_id.as_deref(), Some("deprov-i1"));
    settle(&engine).await;

    // Idle past the reschedule interval.
    let later = Utc::now() + Duration::minutes(5);
    assert_eq!(engine.maintainer().resume_operations(later).await.unwrap(), 1);
    let done = wait_for_operation(repo.as_ref(), id, Operation::is_terminal).await;
    assert_eq!(done.state, OperationState::Succeeded);
    assert!(!done.reschedule);
    assert_eq!(backend.polls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(
        repo.get_resource(&scope, ResourceType::Instance, "i1")
            .await
            .unwrap_err()
            .is_not_found()
    );
}

async fn wait_for_count(repo: &Arc<dyn Repository>, expected: usize) {
    for _ in 0..200 {
        if stored(repo).await.len() == expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("expected {expected} operations, found {}", stored(repo).await.len());
}

#[tokio::test(start_paused = true)]
async fn periodic_sweeps_run_on_their_own_intervals() {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let scope = Scope::root();
    let expired = aged("i1", OperationState::Succeeded, Duration::days(3));
    let stuck = aged("i2", OperationState::InProgress, Duration::hours(2));
    let fresh = aged("i3", OperationState::Succeeded, Duration::minutes(1));
    for op in [expired.clone(), stuck.clone(), fresh.clone()] {
        repo.create_operation(&scope, op).await.unwrap();
    }

    let config = OperationsConfig {
        job_timeout_secs: 300,
        cleanup_interval_secs: 600,
        ..OperationsConfig::default()
    };
    let maintainer = Arc::new(maintainer(&repo, config));
    maintainer.start().await;
    // Let the sweeps arm their timers before the clock moves.
    tokio::task::yield_now().await;

    tokio::time::advance(std::time::Duration::from_secs(301)).await;
    wait_for_count(&repo, 2).await;
    assert!(
        repo.get_operation(&scope, stuck.id)
            .await
            .unwrap_err()
            .is_not_found()
    );

    tokio::time::advance(std::time::Duration::from_secs(300)).await;
    wait_for_count(&repo, 1).await;
    assert_eq!(stored(&repo).await[0].id, fresh.id);

    maintainer.shutdown().await;
}
