//! In-memory storage backend
//!
//! Single-process only. Envelopes are kept in a `BTreeMap` keyed by
//! sequence, which doubles as the insertion order used for ties and for
//! finding the head of each ordering group.
//!
//! With [`MemoryBackend::with_native_retry`] the backend reserves
//! claimed envelopes instead of removing them and redelivers failures
//! itself following a [`RetryPolicy`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Session, Subscription, Wakeups};
use crate::clock::{Clock, add_delay, truncate_millis};
use crate::delivery::DeliveryOutcome;
use crate::envelope::{Envelope, WorkerId};
use crate::error::Result;
use crate::ordering::{Claim, OrderingLease};
use crate::retry::RetryPolicy;

struct StoredEnvelope {
    envelope: Envelope,
    /// Set while a reserve-mode claim is in flight
    reserved_until: Option<DateTime<Utc>>,
}

struct LockRecord {
    owner: WorkerId,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    messages: BTreeMap<i64, StoredEnvelope>,
    locks: HashMap<String, LockRecord>,
    next_sequence: i64,
}

impl MemoryState {
    fn push(&mut self, envelope: &Envelope) {
        self.next_sequence += 1;
        let mut envelope = envelope.clone();
        envelope.sequence = Some(self.next_sequence);
        self.messages.insert(
            self.next_sequence,
            StoredEnvelope {
                envelope,
                reserved_until: None,
            },
        );
    }

    fn lock_is_free(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.locks
            .get(key)
            .is_none_or(|lock| lock.expires_at <= now)
    }

    fn try_lock(
        &mut self,
        key: &str,
        worker: &WorkerId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> bool {
        if !self.lock_is_free(key, now) {
            return false;
        }
        self.locks.insert(
            key.to_string(),
            LockRecord {
                owner: worker.clone(),
                expires_at,
            },
        );
        true
    }

    /// Sequence of the envelope the next claim should take
    fn next_claimable(&self, now: DateTime<Utc>) -> Option<i64> {
        // Ascending iteration means the first sequence seen per key is its head.
        let mut heads: HashMap<&str, i64> = HashMap::new();
        for (sequence, stored) in &self.messages {
            if let Some(key) = stored.envelope.ordering_key.as_deref() {
                heads.entry(key).or_insert(*sequence);
            }
        }

        self.messages
            .iter()
            .filter(|(_, stored)| {
                stored.envelope.is_visible_at(now)
                    && stored.reserved_until.is_none_or(|until| until <= now)
            })
            .filter(|(sequence, stored)| match stored.envelope.ordering_key.as_deref() {
                None => true,
                Some(key) => heads.get(key) == Some(*sequence) && self.lock_is_free(key, now),
            })
            .min_by_key(|(sequence, stored)| (stored.envelope.visible_at, **sequence))
            .map(|(sequence, _)| *sequence)
    }
}

/// In-memory queue storage
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
    native_retry: Option<RetryPolicy>,
    wakeups: Wakeups,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>, lease_duration: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            lease_duration,
            native_retry: None,
            wakeups: Wakeups::new(),
        }
    }

    /// Reserve claimed envelopes and redeliver failures per `policy`
    pub fn with_native_retry(mut self, policy: RetryPolicy) -> Self {
        self.native_retry = Some(policy);
        self
    }

    pub fn native_retry(&self) -> bool {
        self.native_retry.is_some()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    pub async fn insert(&self, envelope: &Envelope) -> Result<()> {
        self.state.lock().await.push(envelope);
        Ok(())
    }

    pub async fn insert_many(&self, envelopes: &[Envelope]) -> Result<()> {
        let mut state = self.state.lock().await;
        for envelope in envelopes {
            state.push(envelope);
        }
        Ok(())
    }

    pub async fn claim_next(&self, worker: &WorkerId) -> Result<Option<Claim>> {
        let now = self.clock.now();
        let deadline = self.lease_deadline(now);
        let mut state = self.state.lock().await;

        let Some(sequence) = state.next_claimable(now) else {
            return Ok(None);
        };
        let Some(envelope) = state
            .messages
            .get(&sequence)
            .map(|stored| stored.envelope.clone())
        else {
            return Ok(None);
        };

        let lease = match &envelope.ordering_key {
            Some(key) => {
                if !state.try_lock(key, worker, now, deadline) {
                    return Ok(None);
                }
                Some(OrderingLease::new(
                    key.clone(),
                    worker.clone(),
                    deadline,
                    Session::Memory,
                ))
            }
            None => None,
        };

        if self.native_retry.is_some() {
            if let Some(stored) = state.messages.get_mut(&sequence) {
                stored.reserved_until = Some(deadline);
            }
        } else {
            state.messages.remove(&sequence);
        }

        Ok(Some(Claim::new(envelope, lease)))
    }

    /// Acknowledge or reschedule a reserved envelope
    pub async fn settle(&self, envelope: &Envelope, outcome: &DeliveryOutcome) -> Result<()> {
        let (Some(policy), Some(sequence)) = (&self.native_retry, envelope.sequence) else {
            return Ok(());
        };

        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if outcome.is_success() {
            state.messages.remove(&sequence);
            return Ok(());
        }

        let attempt = envelope.attempt.saturating_add(1);
        match policy.next_delay(attempt) {
            Some(delay) => {
                if let Some(stored) = state.messages.get_mut(&sequence) {
                    stored.envelope.attempt = attempt;
                    stored.envelope.visible_at =
                        truncate_millis(add_delay(now, delay).unwrap_or(now));
                    stored.reserved_until = None;
                }
                tracing::debug!(
                    envelope_id = %envelope.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Envelope rescheduled for redelivery"
                );
            }
            None => {
                state.messages.remove(&sequence);
                tracing::error!(
                    envelope_id = %envelope.id,
                    attempts = attempt,
                    "Redelivery attempts exhausted; envelope discarded"
                );
            }
        }

        Ok(())
    }

    pub async fn acquire_ordering_lock(
        &self,
        key: &str,
        worker: &WorkerId,
    ) -> Result<Option<OrderingLease>> {
        let now = self.clock.now();
        let deadline = self.lease_deadline(now);
        let mut state = self.state.lock().await;

        if !state.try_lock(key, worker, now, deadline) {
            return Ok(None);
        }

        Ok(Some(OrderingLease::new(
            key.to_string(),
            worker.clone(),
            deadline,
            Session::Memory,
        )))
    }

    pub(crate) async fn release_lock(&self, key: &str, owner: &WorkerId) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.locks.get(key).is_some_and(|lock| &lock.owner == owner) {
            state.locks.remove(key);
        } else {
            tracing::warn!(
                ordering_key = %key,
                owner = %owner,
                "Ordering lock was no longer held at release"
            );
        }

        Ok(())
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        add_delay(now, self.lease_duration).unwrap_or(now)
    }

    pub fn notify(&self) {
        self.wakeups.notify();
    }

    pub fn subscribe(&self) -> Subscription {
        self.wakeups.subscribe()
    }

    pub async fn drop_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.messages.clear();
        state.locks.clear();
        Ok(())
    }

    pub async fn pending_count(&self) -> u64 {
        self.state.lock().await.messages.len() as u64
    }

    pub async fn active_lock_count(&self) -> u64 {
        let now = self.clock.now();
        self.state
            .lock()
            .await
            .locks
            .values()
            .filter(|lock| lock.expires_at > now)
            .count() as u64
    }
}
