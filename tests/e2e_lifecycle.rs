//! E2E tests for queue lifecycle: initialization, listen, dispose

mod common;

use common::{Recorder, TestQueue, recording_handler, spawn_listener, test_config, wait_until};
use futures::future::BoxFuture;
use resort_queue::{
    CancellationToken, EnqueueOptions, Envelope, HandlerError, MessageQueue, QueueError,
    SchedulerState, WorkerId,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_initialization_on_fresh_database() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);

    let first = MessageQueue::from_config(&config).await.unwrap();
    let second = MessageQueue::from_config(&config).await.unwrap();

    let (a, b) = tokio::join!(
        first.backend().initialize(),
        second.backend().initialize()
    );
    assert_ok!(a);
    assert_ok!(b);

    // Both instances see the same tables.
    first.enqueue("shared", EnqueueOptions::new()).await.unwrap();
    assert_eq!(second.backend().pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_enqueue_initializes_lazily() {
    let test = TestQueue::sqlite().await;

    let id = assert_ok!(test.queue.enqueue("first", EnqueueOptions::new()).await);
    assert!(!id.to_string().is_empty());
    assert_eq!(test.queue.backend().pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_initialization_failure_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let queue = MessageQueue::from_config(&config).await.unwrap();

    // A view occupying the table name makes index creation fail.
    if let resort_queue::Backend::Sqlite(sqlite) = queue.backend().as_ref() {
        sqlx::query("CREATE VIEW test_queue_messages AS SELECT 1 AS sequence")
            .execute(sqlite.pool())
            .await
            .unwrap();
    }

    let result = queue.enqueue("x", EnqueueOptions::new()).await;
    assert!(matches!(result, Err(QueueError::Initialization(_))));

    let listen = queue
        .listen(
            |_e: Envelope| async { Ok::<(), HandlerError>(()) },
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(listen, Err(QueueError::Initialization(_))));
    assert_eq!(*queue.scheduler_state().borrow(), SchedulerState::Stopped);

    // The failure is not remembered: once the obstacle is gone the
    // next call sets the schema up.
    if let resort_queue::Backend::Sqlite(sqlite) = queue.backend().as_ref() {
        sqlx::query("DROP VIEW test_queue_messages")
            .execute(sqlite.pool())
            .await
            .unwrap();
    }
    assert_ok!(queue.enqueue("x", EnqueueOptions::new()).await);
    assert_eq!(queue.backend().pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_second_listener_on_same_instance_is_rejected() {
    let test = TestQueue::sqlite().await;
    let recorder = Recorder::new();
    let cancel = CancellationToken::new();
    let listener = spawn_listener(&test.queue, recording_handler(&recorder), &cancel);

    let mut state = test.queue.scheduler_state();
    state
        .wait_for(|state| *state != SchedulerState::Stopped)
        .await
        .unwrap();

    let second = test
        .queue
        .listen(recording_handler(&recorder), cancel.clone())
        .await;
    assert!(matches!(second, Err(QueueError::AlreadyListening)));

    cancel.cancel();
    listener.await.unwrap().unwrap();

    // Listening again after the first loop ended is allowed.
    let cancel = CancellationToken::new();
    let again = spawn_listener(&test.queue, recording_handler(&recorder), &cancel);
    test.queue.enqueue("after", EnqueueOptions::new()).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || recorder.len() == 1).await);
    cancel.cancel();
    again.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dispose_without_listen_rejects_new_work() {
    let test = TestQueue::sqlite().await;
    test.queue.dispose().await;
    test.queue.dispose().await;

    let enqueue = test.queue.enqueue("late", EnqueueOptions::new()).await;
    assert!(matches!(enqueue, Err(QueueError::Disposed)));

    let listen = test
        .queue
        .listen(
            |_e: Envelope| async { Ok::<(), HandlerError>(()) },
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(listen, Err(QueueError::Disposed)));
}

#[tokio::test]
async fn test_dispose_stops_a_running_listener() {
    let test = TestQueue::sqlite().await;
    let recorder = Recorder::new();
    let cancel = CancellationToken::new();
    let listener = spawn_listener(&test.queue, recording_handler(&recorder), &cancel);

    test.queue.enqueue("one", EnqueueOptions::new()).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || recorder.len() == 1).await);

    test.queue.dispose().await;
    assert_ok!(listener.await.unwrap());
    assert!(!cancel.is_cancelled());
    assert_eq!(*test.queue.scheduler_state().borrow(), SchedulerState::Stopped);
}

#[tokio::test]
async fn test_cancel_clears_pending_timers() {
    let test = TestQueue::sqlite().await;
    let recorder = Recorder::new();
    let cancel = CancellationToken::new();
    let listener = spawn_listener(&test.queue, recording_handler(&recorder), &cancel);

    test.queue
        .enqueue("next-hour", EnqueueOptions::new().delay(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert_eq!(test.queue.pending_timers().await, 1);

    cancel.cancel();
    listener.await.unwrap().unwrap();
    assert_eq!(test.queue.pending_timers().await, 0);

    // The envelope itself stays durable.
    assert_eq!(test.queue.backend().pending_count().await.unwrap(), 1);
    assert_eq!(recorder.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_connection_or_lock_leak_under_follow_ups() {
    let test = TestQueue::with_config(|config| config.database.max_connections = 2).await;
    let recorder: Recorder<u32> = Recorder::new();
    let cancel = CancellationToken::new();

    // Each delivery enqueues the next step until 15 steps ran.
    let queue = Arc::clone(&test.queue);
    let seen = recorder.clone();
    let handler = move |envelope: Envelope| -> BoxFuture<'static, Result<(), HandlerError>> {
        let queue = Arc::clone(&queue);
        let seen = seen.clone();
        Box::pin(async move {
            let step: u32 = envelope.decode()?;
            seen.push(step);
            if step < 15 {
                queue
                    .enqueue(&(step + 1), EnqueueOptions::new().ordering_key("chain"))
                    .await?;
            }
            Ok(())
        })
    };
    let listener = spawn_listener(&test.queue, handler, &cancel);

    test.queue
        .enqueue(&1u32, EnqueueOptions::new().ordering_key("chain"))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || recorder.len() == 15).await);
    assert_eq!(recorder.snapshot(), (1..=15).collect::<Vec<_>>());

    cancel.cancel();
    listener.await.unwrap().unwrap();
    assert_eq!(test.queue.backend().active_lock_count().await.unwrap(), 0);
    assert_eq!(test.queue.backend().pending_count().await.unwrap(), 0);

    // An unrelated worker can take the key right away.
    let lease = test
        .queue
        .backend()
        .acquire_ordering_lock("chain", &WorkerId::new("fresh-worker"))
        .await
        .unwrap()
        .expect("lock leaked");
    test.queue
        .backend()
        .release_ordering_lock(lease)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_drop_all_empties_the_queue() {
    let test = TestQueue::sqlite().await;
    test.queue
        .enqueue_many(&["a", "b", "c"], EnqueueOptions::new())
        .await
        .unwrap();
    assert_eq!(test.queue.backend().pending_count().await.unwrap(), 3);

    test.queue.drop_all().await.unwrap();

    // The tables are gone; the queue is only good for dispose now.
    assert!(test.queue.backend().pending_count().await.is_err());
    test.queue.dispose().await;
}
