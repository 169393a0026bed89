//! End-to-end behavior of the manager over the in-memory backend.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use ana::{AnaError, Manager, OperationStatus, Repository as _, TrackedOperation};
use ana_testing::{InMemoryRepository, MockOperation};
use chrono::{Duration, Utc};

type Repository = InMemoryRepository<String, String>;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_execute_once() {
    let repository = Repository::new();
    let manager = Arc::new(Manager::new(repository.clone()));
    let operation = MockOperation::succeeding("done")
        .with_delay(StdDuration::from_millis(50))
        .with_timeout(Duration::seconds(30))
        .with_expiration(Duration::minutes(5));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        let operation = operation.clone();
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(fastrand::u64(0..10))).await;
            manager.call(&operation).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert_eq!(result, "done");
                succeeded += 1;
            }
            Err(AnaError::StillRunning { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(operation.calls(), 1);
    assert!(succeeded >= 1);
}

#[tokio::test]
async fn test_finished_operation_is_replayed_without_running() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());
    let operation = MockOperation::succeeding("first");

    assert_eq!(manager.call(&operation).await.unwrap(), "first");
    assert_eq!(manager.call(&operation).await.unwrap(), "first");
    assert_eq!(manager.call(&operation).await.unwrap(), "first");

    assert_eq!(operation.calls(), 1);
    assert_eq!(repository.len(), 1);
}

#[tokio::test]
async fn test_distinct_reference_times_are_distinct_operations() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());
    let reference = Utc::now();
    let first = MockOperation::succeeding("a").with_reference_time(reference);
    let second =
        MockOperation::succeeding("b").with_reference_time(reference + Duration::seconds(1));

    assert_eq!(manager.call(&first).await.unwrap(), "a");
    assert_eq!(manager.call(&second).await.unwrap(), "b");
    assert_eq!(repository.len(), 2);
}

#[tokio::test]
async fn test_failed_operation_is_retried() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());
    let reference = Utc::now();

    let failing = MockOperation::failing("Boom!").with_reference_time(reference);
    assert_eq!(manager.call(&failing).await.unwrap_err().to_string(), "Boom!");

    let stored = repository.get("key", "target", reference).unwrap();
    assert_eq!(stored.status, OperationStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("Boom!"));

    let succeeding = MockOperation::succeeding("recovered").with_reference_time(reference);
    assert_eq!(manager.call(&succeeding).await.unwrap(), "recovered");

    let stored = repository.get("key", "target", reference).unwrap();
    assert_eq!(stored.status, OperationStatus::Finished);
    assert_eq!(stored.result.as_deref(), Some("recovered"));
    assert_eq!(stored.error, None);
}

#[tokio::test]
async fn test_panic_is_persisted_as_failure() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());
    let reference = Utc::now();
    let operation = MockOperation::panicking("Boom!").with_reference_time(reference);

    let error = manager.call(&operation).await.unwrap_err();
    assert!(matches!(error, AnaError::Panic(_)));

    let stored = repository.get("key", "target", reference).unwrap();
    assert_eq!(stored.status, OperationStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("Got panic \"Boom!\""));
}

#[tokio::test]
async fn test_timed_out_claim_is_taken_over() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());
    let reference = Utc::now() - Duration::seconds(10);

    // A caller that crashed mid-run left this behind.
    let mut abandoned = TrackedOperation::ready(
        "key",
        "target",
        "payload".to_string(),
        reference,
        Some(reference + Duration::seconds(5)),
        Some(reference + Duration::minutes(5)),
    );
    abandoned.status = OperationStatus::Running;
    abandoned.started_at = Some(reference);
    repository.insert(abandoned);

    let operation = MockOperation::succeeding("rescued")
        .with_reference_time(reference)
        .with_expiration(Duration::minutes(5));

    assert_eq!(manager.call(&operation).await.unwrap(), "rescued");
    assert_eq!(operation.calls(), 1);
    assert_eq!(
        repository.get("key", "target", reference).unwrap().status,
        OperationStatus::Finished
    );
}

#[tokio::test]
async fn test_running_claim_without_timeout_blocks_callers() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());
    let reference = Utc::now() - Duration::hours(1);

    let mut running = TrackedOperation::ready(
        "key",
        "target",
        "payload".to_string(),
        reference,
        None,
        None,
    );
    running.status = OperationStatus::Running;
    repository.insert(running);

    let operation = MockOperation::succeeding("never")
        .with_reference_time(reference)
        .with_timeout(Duration::zero())
        .with_expiration(Duration::zero());

    assert!(matches!(
        manager.call(&operation).await,
        Err(AnaError::StillRunning { .. })
    ));
    assert_eq!(operation.calls(), 0);
}

#[tokio::test]
async fn test_result_past_expiration_is_vetoed() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());
    let reference = Utc::now();
    let operation = MockOperation::succeeding("late")
        .with_reference_time(reference)
        .with_expiration(Duration::milliseconds(50))
        .with_delay(StdDuration::from_millis(150));

    let error = manager.call(&operation).await.unwrap_err();
    assert!(matches!(error, AnaError::Vetoed { .. }));
    assert_eq!(operation.calls(), 1);

    let stored = repository.get("key", "target", reference).unwrap();
    assert_eq!(stored.status, OperationStatus::Failed);
    assert_eq!(stored.result, None);
}

#[tokio::test]
async fn test_late_request_waits_for_first_claim_owner() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());
    // The request arrives after its own timeout window would have closed.
    let operation = MockOperation::succeeding("done")
        .with_reference_time(Utc::now() - Duration::seconds(20))
        .with_timeout(Duration::seconds(5))
        .with_expiration(Duration::zero());

    assert!(repository.fetch_or_start(&operation).await.unwrap().is_none());

    assert!(matches!(
        manager.call(&operation).await,
        Err(AnaError::StillRunning { .. })
    ));

    let mut session = repository.new_session(&operation).await.unwrap();
    session.call().await;
    session.close().await.unwrap();
    assert_eq!(session.into_result().unwrap(), "done");

    assert_eq!(manager.call(&operation).await.unwrap(), "done");
    assert_eq!(operation.calls(), 1);
}

#[tokio::test]
async fn test_retry_without_timeout_is_not_taken_over_again() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());
    let reference = Utc::now() - Duration::seconds(10);

    let mut abandoned = TrackedOperation::ready(
        "key",
        "target",
        "payload".to_string(),
        reference,
        Some(reference + Duration::seconds(5)),
        None,
    );
    abandoned.status = OperationStatus::Running;
    repository.insert(abandoned);

    let operation = MockOperation::succeeding("once")
        .with_reference_time(reference)
        .with_timeout(Duration::zero())
        .with_expiration(Duration::zero());

    // The first caller takes the timed-out record over and no longer has a deadline.
    let claimed = repository.fetch_or_start(&operation).await.unwrap().unwrap();
    assert!(!claimed.still_running(Utc::now()));
    assert_eq!(repository.get("key", "target", reference).unwrap().timeout, None);

    assert!(matches!(
        manager.call(&operation).await,
        Err(AnaError::StillRunning { .. })
    ));
    assert_eq!(operation.calls(), 0);
}

#[tokio::test]
async fn test_locks_are_released_after_calls() {
    let repository = Repository::new();
    let manager = Manager::new(repository.clone());

    for index in 0..5 {
        let operation = MockOperation::succeeding("done").with_key(format!("key-{}", index));
        manager.call(&operation).await.unwrap();
        manager.call(&operation).await.unwrap();
    }

    assert_eq!(repository.len(), 5);
    assert_eq!(repository.locked_identities(), 0);
}
