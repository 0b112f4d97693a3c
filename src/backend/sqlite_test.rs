//! SQLite backend tests

use super::*;
use crate::clock::{ManualClock, from_millis, to_millis};
use crate::config::DatabaseConfig;
use crate::envelope::EnqueueOptions;
use sqlx::SqlitePool;
use std::time::Duration;
use tempfile::TempDir;

const LEASE: Duration = Duration::from_secs(60);

/// Helper to create a test backend driven by a manual clock
async fn create_test_backend() -> (SqliteBackend, ManualClock, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        path: temp_dir.path().join("queue.db"),
        max_connections: 4,
        busy_timeout_ms: 5000,
        table_prefix: "test_queue".to_string(),
    };
    let clock = ManualClock::new(from_millis(1_700_000_000_000));
    let backend = SqliteBackend::connect(&config, Arc::new(clock.clone()), LEASE)
        .await
        .unwrap();
    backend.initialize().await.unwrap();
    (backend, clock, temp_dir)
}

fn envelope(payload: &str, options: EnqueueOptions, clock: &ManualClock) -> Envelope {
    Envelope::encode(payload, &options, clock.now()).unwrap()
}

async fn settle_claim(backend: &SqliteBackend, claim: Claim) -> Envelope {
    let (envelope, lease) = claim.into_parts();
    if let Some(mut lease) = lease {
        if let Some(Session::Sqlite(connection)) = lease.take_session() {
            backend
                .release_lock(connection, lease.key(), lease.owner())
                .await
                .unwrap();
        }
    }
    envelope
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let (backend, _clock, _temp_dir) = create_test_backend().await;

    let (first, second) = tokio::join!(backend.initialize(), backend.initialize());
    first.unwrap();
    second.unwrap();
    assert_eq!(backend.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_two_instances_initialize_same_file() {
    let temp_dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        path: temp_dir.path().join("shared.db"),
        max_connections: 2,
        busy_timeout_ms: 5000,
        table_prefix: "shared".to_string(),
    };
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(from_millis(0)));
    let a = SqliteBackend::connect(&config, clock.clone(), LEASE)
        .await
        .unwrap();
    let b = SqliteBackend::connect(&config, clock, LEASE).await.unwrap();

    let (first, second) = tokio::join!(a.initialize(), b.initialize());
    first.unwrap();
    second.unwrap();
}

#[tokio::test]
async fn test_claim_returns_earliest_visible_first() {
    let (backend, clock, _temp_dir) = create_test_backend().await;
    let worker = WorkerId::new("worker-a");

    let later = envelope(
        "later",
        EnqueueOptions::new().delay(Duration::from_secs(5)),
        &clock,
    );
    let first = envelope("first", EnqueueOptions::new(), &clock);
    let second = envelope("second", EnqueueOptions::new(), &clock);
    backend.insert(&later).await.unwrap();
    backend.insert(&first).await.unwrap();
    backend.insert(&second).await.unwrap();

    let claimed = backend.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(claimed.envelope().id, first.id);
    assert!(claimed.lease().is_none());

    let claimed = backend.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(claimed.envelope().id, second.id);

    // The delayed envelope stays invisible until its time arrives.
    assert!(backend.claim_next(&worker).await.unwrap().is_none());
    assert_eq!(backend.pending_count().await.unwrap(), 1);

    clock.advance(Duration::from_secs(5));
    let claimed = backend.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(claimed.envelope().id, later.id);
    assert_eq!(claimed.envelope().decode::<String>().unwrap(), "later");
    assert_eq!(backend.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_ordering_lock_blocks_same_key() {
    let (backend, clock, _temp_dir) = create_test_backend().await;
    let worker_a = WorkerId::new("worker-a");
    let worker_b = WorkerId::new("worker-b");

    let a = envelope("a", EnqueueOptions::new().ordering_key("k"), &clock);
    let b = envelope("b", EnqueueOptions::new().ordering_key("k"), &clock);
    let other = envelope("other", EnqueueOptions::new().ordering_key("j"), &clock);
    backend.insert(&a).await.unwrap();
    backend.insert(&b).await.unwrap();
    backend.insert(&other).await.unwrap();

    let claim_a = backend.claim_next(&worker_a).await.unwrap().unwrap();
    assert_eq!(claim_a.envelope().id, a.id);
    assert_eq!(claim_a.lease().unwrap().key(), "k");
    assert_eq!(backend.active_lock_count().await.unwrap(), 1);

    // "b" waits for "a"; the unrelated key is still available.
    let claim_other = backend.claim_next(&worker_b).await.unwrap().unwrap();
    assert_eq!(claim_other.envelope().id, other.id);
    settle_claim(&backend, claim_other).await;
    assert!(backend.claim_next(&worker_b).await.unwrap().is_none());

    settle_claim(&backend, claim_a).await;
    assert_eq!(backend.active_lock_count().await.unwrap(), 0);

    let claim_b = backend.claim_next(&worker_b).await.unwrap().unwrap();
    assert_eq!(claim_b.envelope().id, b.id);
    settle_claim(&backend, claim_b).await;
}

#[tokio::test]
async fn test_head_of_group_is_claimed_first_even_when_delayed() {
    let (backend, clock, _temp_dir) = create_test_backend().await;
    let worker = WorkerId::new("worker-a");

    let head = envelope(
        "head",
        EnqueueOptions::new()
            .ordering_key("k")
            .delay(Duration::from_secs(10)),
        &clock,
    );
    let tail = envelope("tail", EnqueueOptions::new().ordering_key("k"), &clock);
    backend.insert(&head).await.unwrap();
    backend.insert(&tail).await.unwrap();

    assert!(backend.claim_next(&worker).await.unwrap().is_none());

    clock.advance(Duration::from_secs(10));
    let claim = backend.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(claim.envelope().id, head.id);
    settle_claim(&backend, claim).await;

    let claim = backend.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(claim.envelope().id, tail.id);
    settle_claim(&backend, claim).await;
}

#[tokio::test]
async fn test_expired_lock_is_taken_over() {
    let (backend, clock, _temp_dir) = create_test_backend().await;
    let worker_a = WorkerId::new("worker-a");
    let worker_b = WorkerId::new("worker-b");

    let mut stale = backend
        .acquire_ordering_lock("k", &worker_a)
        .await
        .unwrap()
        .unwrap();
    assert!(
        backend
            .acquire_ordering_lock("k", &worker_b)
            .await
            .unwrap()
            .is_none()
    );

    clock.advance(LEASE + Duration::from_millis(1));
    let mut fresh = backend
        .acquire_ordering_lock("k", &worker_b)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.owner(), &worker_b);

    // Releasing the stale lease must not remove the new owner's lock.
    if let Some(Session::Sqlite(connection)) = stale.take_session() {
        backend
            .release_lock(connection, stale.key(), stale.owner())
            .await
            .unwrap();
    }
    assert_eq!(backend.active_lock_count().await.unwrap(), 1);

    if let Some(Session::Sqlite(connection)) = fresh.take_session() {
        backend
            .release_lock(connection, fresh.key(), fresh.owner())
            .await
            .unwrap();
    }
    assert_eq!(backend.active_lock_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_undecodable_row_is_discarded() {
    let (backend, clock, _temp_dir) = create_test_backend().await;
    let worker = WorkerId::new("worker-a");
    let now = to_millis(clock.now());

    sqlx::query(
        "INSERT INTO test_queue_messages
            (id, payload, ordering_key, visible_at, attempt, created_at)
         VALUES ('not-a-ulid', '{}', 'k', ?, 0, ?)",
    )
    .bind(now)
    .bind(now)
    .execute(backend.pool())
    .await
    .unwrap();
    let good = envelope("good", EnqueueOptions::new().ordering_key("k"), &clock);
    backend.insert(&good).await.unwrap();
    assert_eq!(backend.pending_count().await.unwrap(), 2);

    // The broken head no longer blocks its key group.
    let claimed = backend.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(settle_claim(&backend, claimed).await.id, good.id);
    assert_eq!(backend.pending_count().await.unwrap(), 0);
    assert!(backend.claim_next(&worker).await.unwrap().is_none());
}

#[tokio::test]
async fn test_insert_many_is_atomic() {
    let (backend, clock, _temp_dir) = create_test_backend().await;

    let batch: Vec<Envelope> = (0..5)
        .map(|i| envelope(&format!("m{i}"), EnqueueOptions::new(), &clock))
        .collect();
    backend.insert_many(&batch).await.unwrap();
    assert_eq!(backend.pending_count().await.unwrap(), 5);

    // A duplicate id violates the unique constraint and rolls back the batch.
    let duplicate = vec![
        envelope("fresh", EnqueueOptions::new(), &clock),
        batch[0].clone(),
    ];
    assert!(backend.insert_many(&duplicate).await.is_err());
    assert_eq!(backend.pending_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_claims_do_not_leak_connections() {
    let temp_dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        path: temp_dir.path().join("small.db"),
        max_connections: 2,
        busy_timeout_ms: 5000,
        table_prefix: "small".to_string(),
    };
    let clock = ManualClock::new(from_millis(1_700_000_000_000));
    let backend = SqliteBackend::connect(&config, Arc::new(clock.clone()), LEASE)
        .await
        .unwrap();
    backend.initialize().await.unwrap();
    let worker = WorkerId::new("worker-a");

    for i in 0..10 {
        let options = EnqueueOptions::new().ordering_key(format!("key-{}", i % 3));
        backend
            .insert(&envelope("m", options, &clock))
            .await
            .unwrap();
    }

    let mut claimed = 0;
    while let Some(claim) = tokio::time::timeout(
        Duration::from_secs(5),
        backend.claim_next(&worker),
    )
    .await
    .expect("pool exhausted")
    .unwrap()
    {
        settle_claim(&backend, claim).await;
        claimed += 1;
    }

    assert_eq!(claimed, 10);
    assert_eq!(backend.active_lock_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_drop_all_removes_tables() {
    let (backend, clock, _temp_dir) = create_test_backend().await;
    backend
        .insert(&envelope("gone", EnqueueOptions::new(), &clock))
        .await
        .unwrap();

    backend.drop_all().await.unwrap();

    assert!(backend.pending_count().await.is_err());
}

#[tokio::test]
async fn test_rejects_unsafe_table_prefix() {
    let temp_dir = TempDir::new().unwrap();
    let pool = SqlitePool::connect(&format!(
        "sqlite:{}?mode=rwc",
        temp_dir.path().join("prefix.db").display()
    ))
    .await
    .unwrap();

    let result = SqliteBackend::from_pool(
        pool,
        "x; DROP TABLE y",
        Arc::new(ManualClock::new(from_millis(0))),
        LEASE,
    );
    assert!(matches!(result, Err(QueueError::Validation(_))));
}
