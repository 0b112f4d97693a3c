//! Ordering-key serialization
//!
//! Envelopes that share an ordering key are delivered one at a time, in
//! enqueue order, across every worker sharing a backend. A worker that
//! claims a keyed envelope holds an [`OrderingLease`] for the key until
//! its handler has finished; the lease is released on the same backend
//! session that acquired it.
//!
//! Leases expire. A handler that outlives its lease may overlap with the
//! next envelope of the same key on another worker; that window is
//! logged, not prevented.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::backend::{Backend, Session};
use crate::delivery::DeliveryOutcome;
use crate::envelope::{Envelope, WorkerId};
use crate::error::Result;
use crate::metrics::{ORDERING_LEASES_HELD, QUEUE_CLAIMED_TOTAL, record_backend_error};

/// Exclusive, time-limited right to process one ordering key
pub struct OrderingLease {
    key: String,
    owner: WorkerId,
    expires_at: DateTime<Utc>,
    session: Option<Session>,
}

impl OrderingLease {
    pub(crate) fn new(
        key: String,
        owner: WorkerId,
        expires_at: DateTime<Utc>,
        session: Session,
    ) -> Self {
        ORDERING_LEASES_HELD.inc();
        Self {
            key,
            owner,
            expires_at,
            session: Some(session),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &WorkerId {
        &self.owner
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Detach the session for release; later calls return `None`
    pub(crate) fn take_session(&mut self) -> Option<Session> {
        let session = self.session.take();
        if session.is_some() {
            ORDERING_LEASES_HELD.dec();
        }
        session
    }
}

impl Drop for OrderingLease {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            ORDERING_LEASES_HELD.dec();
            tracing::warn!(
                ordering_key = %self.key,
                owner = %self.owner,
                expires_at = %self.expires_at,
                "Ordering lease dropped without release; key stays blocked until it expires"
            );
        }
    }
}

/// A claimed envelope and, for keyed envelopes, its lease
pub struct Claim {
    envelope: Envelope,
    lease: Option<OrderingLease>,
}

impl Claim {
    pub(crate) fn new(envelope: Envelope, lease: Option<OrderingLease>) -> Self {
        Self { envelope, lease }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn lease(&self) -> Option<&OrderingLease> {
        self.lease.as_ref()
    }

    pub(crate) fn into_parts(self) -> (Envelope, Option<OrderingLease>) {
        (self.envelope, self.lease)
    }
}

/// Claims and settles envelopes on behalf of one worker
#[derive(Clone)]
pub struct OrderingSerializer {
    backend: Arc<Backend>,
    worker: WorkerId,
}

impl OrderingSerializer {
    pub fn new(backend: Arc<Backend>, worker: WorkerId) -> Self {
        Self { backend, worker }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Claim the next eligible envelope for this worker
    pub async fn claim(&self) -> Result<Option<Claim>> {
        let claim = self.backend.claim_next(&self.worker).await?;

        if let Some(claim) = &claim {
            QUEUE_CLAIMED_TOTAL
                .with_label_values(&[self.backend.kind().as_str()])
                .inc();
            tracing::debug!(
                envelope_id = %claim.envelope().id,
                ordering_key = ?claim.envelope().ordering_key,
                worker = %self.worker,
                "Envelope claimed"
            );
        }

        Ok(claim)
    }

    /// Settle the envelope, then release its lease
    ///
    /// The lease is released even if settling fails.
    pub async fn complete(&self, claim: Claim, outcome: &DeliveryOutcome) -> Result<()> {
        let (envelope, lease) = claim.into_parts();

        let settled = self.backend.settle(&envelope, outcome).await;
        if settled.is_err() {
            record_backend_error("settle");
        }

        let released = match lease {
            Some(lease) => self.release(lease).await,
            None => Ok(()),
        };

        settled.and(released)
    }

    pub async fn release(&self, lease: OrderingLease) -> Result<()> {
        if lease.is_expired(self.backend.clock().now()) {
            tracing::warn!(
                ordering_key = %lease.key(),
                owner = %lease.owner(),
                "Ordering lease expired before release; another worker may already be processing this key"
            );
        }

        self.backend
            .release_ordering_lock(lease)
            .await
            .inspect_err(|_| record_backend_error("release_lock"))
    }
}
