//! Storage backends
//!
//! A backend persists envelopes and hands them out through an atomic
//! claim. The contract every variant implements:
//!
//! - `initialize`: idempotent, memoized schema setup; safe to race
//! - `insert` / `insert_many`: durable once they return
//! - `claim_next`: earliest visible envelope whose ordering group is
//!   free, removed (or reserved) and, if keyed, paired with a lease
//! - `settle`: post-handler bookkeeping (reserve mode only)
//! - `release_ordering_lock`: runs on the session that took the lease
//! - `notify` / `subscribe`: best-effort, in-process wake-ups
//! - `drop_all`: remove everything the backend owns
//!
//! The variant is chosen once, at construction.

mod memory;
mod sqlite;

#[cfg(test)]
mod sqlite_test;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub(crate) use sqlite::is_duplicate_object_error;

use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::clock::Clock;
use crate::config::{AppConfig, BackendKind};
use crate::delivery::DeliveryOutcome;
use crate::envelope::{Envelope, WorkerId};
use crate::error::{QueueError, Result};
use crate::ordering::{Claim, OrderingLease};
use crate::retry::RetryPolicy;

/// Capacity of the wake-up channel; lagging receivers just poll once
const WAKEUP_CAPACITY: usize = 64;

/// Storage backend, selected at construction
pub enum Backend {
    Sqlite(SqliteBackend),
    Memory(MemoryBackend),
}

/// Connection or context an ordering lease is bound to
///
/// SQLite leases keep their pooled connection checked out until release
/// so the unlock can never run on a different connection.
pub(crate) enum Session {
    Sqlite(PoolConnection<Sqlite>),
    Memory,
}

impl Backend {
    /// Build the configured backend
    ///
    /// # Errors
    /// Returns error if the database cannot be opened
    pub async fn from_config(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let lease = config.queue.lock_lease();
        match config.queue.backend {
            BackendKind::Sqlite => Ok(Backend::Sqlite(
                SqliteBackend::connect(&config.database, clock, lease).await?,
            )),
            BackendKind::Memory => {
                let backend = MemoryBackend::new(clock, lease);
                Ok(Backend::Memory(if config.queue.native_retry {
                    backend.with_native_retry(RetryPolicy::from(&config.federation.retry))
                } else {
                    backend
                }))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Sqlite(_) => BackendKind::Sqlite,
            Backend::Memory(_) => BackendKind::Memory,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        match self {
            Backend::Sqlite(backend) => backend.clock(),
            Backend::Memory(backend) => backend.clock(),
        }
    }

    /// Whether failed deliveries are redelivered by the backend itself
    pub fn native_retry(&self) -> bool {
        match self {
            Backend::Sqlite(_) => false,
            Backend::Memory(backend) => backend.native_retry(),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        match self {
            Backend::Sqlite(backend) => backend.initialize().await,
            Backend::Memory(backend) => backend.initialize().await,
        }
    }

    pub async fn insert(&self, envelope: &Envelope) -> Result<()> {
        match self {
            Backend::Sqlite(backend) => backend.insert(envelope).await,
            Backend::Memory(backend) => backend.insert(envelope).await,
        }
    }

    pub async fn insert_many(&self, envelopes: &[Envelope]) -> Result<()> {
        match self {
            Backend::Sqlite(backend) => backend.insert_many(envelopes).await,
            Backend::Memory(backend) => backend.insert_many(envelopes).await,
        }
    }

    /// Claim the earliest eligible envelope, or `None` if nothing is due
    pub async fn claim_next(&self, worker: &WorkerId) -> Result<Option<Claim>> {
        match self {
            Backend::Sqlite(backend) => backend.claim_next(worker).await,
            Backend::Memory(backend) => backend.claim_next(worker).await,
        }
    }

    /// Finish a claimed envelope after its handler ran
    pub async fn settle(&self, envelope: &Envelope, outcome: &DeliveryOutcome) -> Result<()> {
        match self {
            Backend::Sqlite(_) => Ok(()),
            Backend::Memory(backend) => backend.settle(envelope, outcome).await,
        }
    }

    /// Take the ordering lock for `key` outside of a claim
    pub async fn acquire_ordering_lock(
        &self,
        key: &str,
        worker: &WorkerId,
    ) -> Result<Option<OrderingLease>> {
        match self {
            Backend::Sqlite(backend) => backend.acquire_ordering_lock(key, worker).await,
            Backend::Memory(backend) => backend.acquire_ordering_lock(key, worker).await,
        }
    }

    /// Release a lease on the session it was acquired with
    pub async fn release_ordering_lock(&self, mut lease: OrderingLease) -> Result<()> {
        let Some(session) = lease.take_session() else {
            return Ok(());
        };

        match (self, session) {
            (Backend::Sqlite(backend), Session::Sqlite(connection)) => {
                backend
                    .release_lock(connection, lease.key(), lease.owner())
                    .await
            }
            (Backend::Memory(backend), Session::Memory) => {
                backend.release_lock(lease.key(), lease.owner()).await
            }
            _ => Err(QueueError::Internal(anyhow::anyhow!(
                "ordering lease for {:?} belongs to a different backend",
                lease.key()
            ))),
        }
    }

    /// Wake up local listeners
    pub fn notify(&self) {
        match self {
            Backend::Sqlite(backend) => backend.notify(),
            Backend::Memory(backend) => backend.notify(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        match self {
            Backend::Sqlite(backend) => backend.subscribe(),
            Backend::Memory(backend) => backend.subscribe(),
        }
    }

    /// Remove every backend-owned resource
    pub async fn drop_all(&self) -> Result<()> {
        match self {
            Backend::Sqlite(backend) => backend.drop_all().await,
            Backend::Memory(backend) => backend.drop_all().await,
        }
    }

    pub async fn close(&self) {
        match self {
            Backend::Sqlite(backend) => backend.close().await,
            Backend::Memory(_) => {}
        }
    }

    /// Number of stored envelopes (including delayed ones)
    pub async fn pending_count(&self) -> Result<u64> {
        match self {
            Backend::Sqlite(backend) => backend.pending_count().await,
            Backend::Memory(backend) => Ok(backend.pending_count().await),
        }
    }

    /// Number of unexpired ordering locks
    pub async fn active_lock_count(&self) -> Result<u64> {
        match self {
            Backend::Sqlite(backend) => backend.active_lock_count().await,
            Backend::Memory(backend) => Ok(backend.active_lock_count().await),
        }
    }
}

/// Broadcast side of the wake-up channel
pub(crate) struct Wakeups {
    sender: broadcast::Sender<()>,
}

impl Wakeups {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(WAKEUP_CAPACITY);
        Self { sender }
    }

    pub(crate) fn notify(&self) {
        // No receivers simply means nobody is listening in this process.
        let _ = self.sender.send(());
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Handle on the wake-up channel
///
/// Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<()>,
}

impl Subscription {
    /// Wait for the next wake-up
    ///
    /// Returns `false` once the channel is closed.
    pub async fn recv(&mut self) -> bool {
        match self.receiver.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => true,
            Err(RecvError::Closed) => false,
        }
    }

    /// Consume every buffered wake-up, reporting whether there was any
    pub fn drain(&mut self) -> bool {
        let mut woke = false;
        loop {
            match self.receiver.try_recv() {
                Ok(()) | Err(TryRecvError::Lagged(_)) => woke = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return woke,
            }
        }
    }
}
