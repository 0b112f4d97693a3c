//! Common test utilities for E2E tests

#![allow(dead_code)]

use resort_queue::{
    CancellationToken, Envelope, HandlerError, MessageHandler, MessageQueue, config,
};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Queue instance backed by a throwaway database
pub struct TestQueue {
    pub queue: Arc<MessageQueue>,
    pub config: config::AppConfig,
    pub _temp_dir: TempDir,
}

impl TestQueue {
    /// SQLite queue with a 100ms poll interval
    pub async fn sqlite() -> Self {
        Self::with_config(|_| {}).await
    }

    /// In-memory queue with a 100ms poll interval
    pub async fn memory() -> Self {
        Self::with_config(|config| config.queue.backend = config::BackendKind::Memory).await
    }

    /// Queue built from the test configuration after `customize` ran
    pub async fn with_config(customize: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        customize(&mut config);

        let queue = MessageQueue::from_config(&config).await.unwrap();

        Self {
            queue: Arc::new(queue),
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Another worker on the same database file, with its own pool
    pub async fn peer(&self) -> Arc<MessageQueue> {
        Arc::new(MessageQueue::from_config(&self.config).await.unwrap())
    }
}

/// Create test configuration
pub fn test_config(temp_dir: &TempDir) -> config::AppConfig {
    config::AppConfig {
        queue: config::QueueConfig {
            backend: config::BackendKind::Sqlite,
            poll_interval_ms: 100,
            lock_lease_seconds: 30,
            worker_id: None,
            native_retry: false,
        },
        database: config::DatabaseConfig {
            path: temp_dir.path().join("queue.db"),
            max_connections: 8,
            busy_timeout_ms: 5000,
            table_prefix: "test_queue".to_string(),
        },
        federation: config::FederationConfig {
            user_agent: "RustResort/test".to_string(),
            request_timeout_seconds: 5,
            retry: config::RetryConfig {
                initial_delay_ms: 50,
                max_delay_ms: 200,
                multiplier: 2.0,
                max_attempts: 3,
                jitter: false,
            },
        },
        logging: config::LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Run `listen` in the background
pub fn spawn_listener<H>(
    queue: &Arc<MessageQueue>,
    handler: H,
    cancel: &CancellationToken,
) -> JoinHandle<resort_queue::Result<()>>
where
    H: MessageHandler + 'static,
{
    let queue = Arc::clone(queue);
    let cancel = cancel.clone();
    tokio::spawn(async move { queue.listen(handler, cancel).await })
}

/// Thread-safe event log shared between handlers and assertions
#[derive(Clone, Default)]
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, event: T) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

/// Handler that records every decoded payload
pub fn recording_handler(
    recorder: &Recorder<String>,
) -> impl Fn(Envelope) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync + 'static {
    let recorder = recorder.clone();
    move |envelope: Envelope| -> BoxFuture<'static, Result<(), HandlerError>> {
        let recorder = recorder.clone();
        Box::pin(async move {
            recorder.push(envelope.decode::<String>()?);
            Ok::<(), HandlerError>(())
        })
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
