//! resort-queue - durable, ordered message queue for ActivityPub delivery
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   MessageQueue (queue)                       │
//! │  - enqueue / enqueue_many / listen / dispose                │
//! │  - delayed wake-up timers (timers)                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Scheduler + Delivery (scheduler)               │
//! │  - startup / notification / interval / follow-up polls      │
//! │  - per-key serialization with leases (ordering)             │
//! │  - panic-safe handler invocation (delivery)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Storage (backend, kv)                      │
//! │  - SQLite (sqlx), shared by many worker processes           │
//! │  - In-memory, single process, optional native retry         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `queue`: Public queue facade
//! - `backend`: Storage contract and its SQLite / memory variants
//! - `ordering`: Ordering-key leases and claim settlement
//! - `scheduler`: Listener loop and poll triggers
//! - `delivery`: Handler trait and invocation
//! - `timers`: Delayed wake-up registry
//! - `retry`: Backoff policy
//! - `clock`: Injectable time source
//! - `envelope`: Message envelope codec
//! - `federation`: Outbound activity delivery built on the queue
//! - `kv`: TTL key-value store used for delivery de-duplication
//! - `config`: Configuration management
//! - `error`: Error types

pub mod backend;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod federation;
pub mod kv;
pub mod metrics;
pub mod ordering;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod timers;

pub use backend::{Backend, MemoryBackend, SqliteBackend, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{DeliveryOutcome, HandlerError, MessageHandler};
pub use envelope::{EnqueueOptions, Envelope, EnvelopeId, WorkerId};
pub use error::{QueueError, Result};
pub use queue::{MessageQueue, QueueOptions};
pub use scheduler::SchedulerState;
pub use tokio_util::sync::CancellationToken;

use std::sync::Arc;

/// Everything a delivery worker process needs
///
/// Built once at startup and shared by the listener and any producer
/// living in the same process.
#[derive(Clone)]
pub struct QueueRuntime {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// The queue itself
    pub queue: Arc<MessageQueue>,

    /// Delivery markers and other small state
    pub kv: Arc<kv::KvStore>,

    /// Producer side of federation delivery
    pub outbox: federation::Outbox,

    /// Consumer side of federation delivery
    pub worker: Arc<federation::OutboxWorker<federation::HttpDeliverer>>,
}

impl QueueRuntime {
    /// Initialize the runtime
    ///
    /// # Steps
    /// 1. Open the configured backend
    /// 2. Create the queue schema
    /// 3. Set up the key-value store on the same storage
    /// 4. Build the HTTP deliverer and outbox worker
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self> {
        tracing::info!("Initializing queue runtime...");

        // 1. Open backend
        let queue = Arc::new(MessageQueue::from_config(&config).await?);
        tracing::info!(
            backend = queue.backend().kind().as_str(),
            worker = %queue.worker_id(),
            "Queue backend ready"
        );

        // 2. Create schema up front so a broken database fails fast
        queue.backend().initialize().await?;

        // 3. Key-value store
        let clock = Arc::clone(queue.backend().clock());
        let kv = match queue.backend().as_ref() {
            Backend::Sqlite(sqlite) => kv::KvStore::sqlite(
                sqlite.pool().clone(),
                &config.database.table_prefix,
                clock,
            )?,
            Backend::Memory(_) => kv::KvStore::memory(clock),
        };
        let kv = Arc::new(kv);

        // 4. Federation delivery
        let deliverer = federation::HttpDeliverer::new(&config.federation)?;
        let worker = Arc::new(
            federation::OutboxWorker::new(
                Arc::clone(&queue),
                deliverer,
                retry::RetryPolicy::from(&config.federation.retry),
            )
            .with_kv(Arc::clone(&kv)),
        );
        let outbox = federation::Outbox::new(Arc::clone(&queue));

        tracing::info!("Queue runtime initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            queue,
            kv,
            outbox,
            worker,
        })
    }

    /// Deliver queued activities until `cancel` fires, then dispose
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let result = self
            .queue
            .listen(Arc::clone(&self.worker).into_handler(), cancel)
            .await;
        self.queue.dispose().await;
        result
    }
}
