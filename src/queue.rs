//! Message queue facade
//!
//! [`MessageQueue`] ties the pieces together: it encodes payloads into
//! envelopes, stores them through the backend, arms wake-up timers for
//! delayed envelopes and runs the listener loop.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::clock::SystemClock;
use crate::config::{AppConfig, QueueConfig};
use crate::delivery::MessageHandler;
use crate::envelope::{EnqueueOptions, Envelope, EnvelopeId, WorkerId};
use crate::error::{QueueError, Result};
use crate::metrics::{QUEUE_ENQUEUED_TOTAL, record_backend_error};
use crate::ordering::OrderingSerializer;
use crate::scheduler::{Scheduler, SchedulerState, StopSignal};
use crate::timers::TimerRegistry;

/// Listener settings
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Ordering-lock owner; random when `None`
    pub worker_id: Option<WorkerId>,
    /// Fallback poll interval
    pub poll_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone().map(WorkerId::new),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Durable, ordered, at-least-once message queue
pub struct MessageQueue {
    backend: Arc<Backend>,
    worker: WorkerId,
    poll_interval: Duration,
    timers: TimerRegistry,
    listening: AtomicBool,
    disposed: AtomicBool,
    shutdown: CancellationToken,
    state: Arc<watch::Sender<SchedulerState>>,
}

/// Clears the listening flag when `listen` returns or is dropped
struct ListeningGuard<'a> {
    listening: &'a AtomicBool,
    state: &'a watch::Sender<SchedulerState>,
}

impl Drop for ListeningGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(SchedulerState::Stopped);
        self.listening.store(false, Ordering::SeqCst);
    }
}

impl MessageQueue {
    pub fn new(backend: Arc<Backend>, options: QueueOptions) -> Self {
        let (state, _) = watch::channel(SchedulerState::Stopped);

        Self {
            backend,
            worker: options.worker_id.unwrap_or_else(WorkerId::random),
            poll_interval: options.poll_interval,
            timers: TimerRegistry::new(),
            listening: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            state: Arc::new(state),
        }
    }

    /// Build the configured backend and wrap it in a queue
    ///
    /// # Errors
    /// Returns error if the backend cannot be opened
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let backend = Backend::from_config(config, Arc::new(SystemClock)).await?;
        Ok(Self::new(
            Arc::new(backend),
            QueueOptions::from(&config.queue),
        ))
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker
    }

    /// Whether failed deliveries are redelivered by the backend
    pub fn native_retry(&self) -> bool {
        self.backend.native_retry()
    }

    /// Watch the listener state
    pub fn scheduler_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Wake-up timers not yet fired
    pub async fn pending_timers(&self) -> usize {
        self.timers.pending().await
    }

    /// Store one message
    ///
    /// Durable once this returns. Immediate messages wake local listeners
    /// right away; delayed ones arm a timer for their visibility time.
    ///
    /// # Errors
    /// Returns error if the queue is disposed, initialization fails, the
    /// payload cannot be serialized or the backend rejects the insert
    pub async fn enqueue<T>(&self, payload: &T, options: EnqueueOptions) -> Result<EnvelopeId>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        self.backend.initialize().await?;

        let envelope = Envelope::encode(payload, &options, self.backend.clock().now())?;
        self.backend
            .insert(&envelope)
            .await
            .inspect_err(|_| record_backend_error("insert"))?;

        QUEUE_ENQUEUED_TOTAL
            .with_label_values(&[self.backend.kind().as_str()])
            .inc();
        tracing::debug!(
            envelope_id = %envelope.id,
            ordering_key = ?envelope.ordering_key,
            delay = ?options.delay,
            "Envelope enqueued"
        );

        self.wake_listeners(&options).await;
        Ok(envelope.id)
    }

    /// Store a batch atomically with shared options
    ///
    /// An empty batch is a no-op.
    pub async fn enqueue_many<T>(
        &self,
        payloads: &[T],
        options: EnqueueOptions,
    ) -> Result<Vec<EnvelopeId>>
    where
        T: Serialize,
    {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_open()?;
        self.backend.initialize().await?;

        let now = self.backend.clock().now();
        let envelopes = payloads
            .iter()
            .map(|payload| Envelope::encode(payload, &options, now))
            .collect::<Result<Vec<_>>>()?;
        let ids = self.store_batch(envelopes).await?;

        self.wake_listeners(&options).await;
        Ok(ids)
    }

    /// Store a batch atomically, each payload with its own options
    ///
    /// Either every envelope is stored or none is. An empty batch is a
    /// no-op.
    pub async fn enqueue_each<T>(&self, items: &[(T, EnqueueOptions)]) -> Result<Vec<EnvelopeId>>
    where
        T: Serialize,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_open()?;
        self.backend.initialize().await?;

        let now = self.backend.clock().now();
        let envelopes = items
            .iter()
            .map(|(payload, options)| Envelope::encode(payload, options, now))
            .collect::<Result<Vec<_>>>()?;
        let ids = self.store_batch(envelopes).await?;

        for (_, options) in items {
            self.wake_listeners(options).await;
        }
        Ok(ids)
    }

    async fn store_batch(&self, envelopes: Vec<Envelope>) -> Result<Vec<EnvelopeId>> {
        self.backend
            .insert_many(&envelopes)
            .await
            .inspect_err(|_| record_backend_error("insert_many"))?;

        QUEUE_ENQUEUED_TOTAL
            .with_label_values(&[self.backend.kind().as_str()])
            .inc_by(envelopes.len() as u64);
        tracing::debug!(count = envelopes.len(), "Envelope batch enqueued");

        Ok(envelopes.into_iter().map(|envelope| envelope.id).collect())
    }

    async fn wake_listeners(&self, options: &EnqueueOptions) {
        match options.delay {
            Some(delay) if !options.is_immediate() => {
                let backend = Arc::clone(&self.backend);
                self.timers
                    .schedule(delay, move || backend.notify())
                    .await;
            }
            _ => self.backend.notify(),
        }
    }

    /// Deliver envelopes to `handler` until `cancel` fires or the queue
    /// is disposed
    ///
    /// Handler failures never end the loop; transient backend errors are
    /// logged and retried on the next wake-up.
    ///
    /// # Errors
    /// Returns `AlreadyListening` if another listener runs on this
    /// instance, or the initialization error if schema setup fails
    pub async fn listen<H>(&self, handler: H, cancel: CancellationToken) -> Result<()>
    where
        H: MessageHandler,
    {
        self.ensure_open()?;
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyListening);
        }
        let _guard = ListeningGuard {
            listening: &self.listening,
            state: &self.state,
        };

        self.backend.initialize().await.inspect_err(|error| {
            tracing::error!(%error, "Queue initialization failed; listener not started");
        })?;

        // Either the caller's token or dispose() stops the loop.
        let stop = StopSignal::new(cancel, self.shutdown.clone());

        let subscription = self.backend.subscribe();
        let scheduler = Scheduler::new(
            OrderingSerializer::new(Arc::clone(&self.backend), self.worker.clone()),
            self.poll_interval,
            Arc::clone(&self.state),
        );

        tracing::info!(
            worker = %self.worker,
            backend = self.backend.kind().as_str(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            native_retry = self.backend.native_retry(),
            "Queue listener started"
        );

        scheduler.run(&handler, subscription, &stop).await;

        self.timers.cancel_all().await;
        tracing::info!(worker = %self.worker, "Queue listener stopped");
        Ok(())
    }

    /// Stop the listener, cancel timers and close the backend
    ///
    /// Idempotent and safe without a prior `listen`. Later calls to
    /// `enqueue` or `listen` fail with `Disposed`.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();

        // Let an in-flight delivery finish before the pool goes away.
        let mut state = self.state.subscribe();
        if state
            .wait_for(|state| *state == SchedulerState::Stopped)
            .await
            .is_err()
        {
            tracing::debug!("Scheduler state channel closed during dispose");
        }

        self.timers.close().await;
        self.backend.close().await;
        tracing::info!(worker = %self.worker, "Queue disposed");
    }

    /// Remove everything the backend stores
    ///
    /// Meant for tests and teardown; the queue is unusable afterwards.
    pub async fn drop_all(&self) -> Result<()> {
        self.timers.cancel_all().await;
        self.backend
            .drop_all()
            .await
            .inspect_err(|_| record_backend_error("drop_all"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(QueueError::Disposed);
        }
        Ok(())
    }
}
