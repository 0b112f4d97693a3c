//! Outbound activity queue
//!
//! [`Outbox`] fans an activity out into one queue message per unique
//! inbox. [`OutboxWorker`] is the listener-side handler that POSTs each
//! message and retries failures with backoff.
//!
//! With an ordering key, messages are keyed per `(key, inbox)`: two
//! activities about the same object reach a given inbox in order, while
//! a slow inbox does not hold up the others.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::deliverer::InboxDeliverer;
use crate::delivery::HandlerError;
use crate::envelope::{EnqueueOptions, Envelope, EnvelopeId};
use crate::error::{QueueError, Result};
use crate::kv::{KvKey, KvStore};
use crate::metrics::FEDERATION_DELIVERIES_TOTAL;
use crate::queue::MessageQueue;
use crate::retry::RetryPolicy;

/// How long a successful delivery is remembered for de-duplication
const DELIVERED_MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One activity addressed to one inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub activity_id: String,
    pub activity_type: String,
    pub inbox: Url,
    pub activity: Value,
    /// Failed deliveries so far
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Drop repeated inboxes, keeping first-seen order
///
/// Compares parsed URLs, so spelling differences such as host case
/// collapse; distinct inbox paths on one domain stay separate.
fn dedupe_inboxes(mut inboxes: Vec<Url>) -> Vec<Url> {
    let mut seen = HashSet::new();
    inboxes.retain(|inbox| seen.insert(inbox.clone()));
    inboxes
}

/// Queue-side entry point for outgoing activities
#[derive(Clone)]
pub struct Outbox {
    queue: Arc<MessageQueue>,
}

impl Outbox {
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue `activity` for every unique inbox
    ///
    /// Every inbox URL is validated before anything is stored, and the
    /// messages are stored in one batch: all of them or none.
    ///
    /// # Errors
    /// Returns error if the activity has no `id`, an inbox URL is invalid
    /// or the queue rejects the messages
    pub async fn send_activity(
        &self,
        activity: &Value,
        inbox_uris: Vec<String>,
        ordering_key: Option<&str>,
    ) -> Result<Vec<EnvelopeId>> {
        let activity_id = activity
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| QueueError::Validation("activity must have an id".to_string()))?
            .to_string();
        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Activity")
            .to_string();

        let total_targets = inbox_uris.len();
        let inboxes = inbox_uris
            .iter()
            .map(|uri| {
                Url::parse(uri).map_err(|e| {
                    QueueError::Validation(format!("invalid inbox URL {uri:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let inboxes = dedupe_inboxes(inboxes);

        let now = self.queue.backend().clock().now();
        let messages: Vec<OutboxMessage> = inboxes
            .into_iter()
            .map(|inbox| OutboxMessage {
                activity_id: activity_id.clone(),
                activity_type: activity_type.clone(),
                inbox,
                activity: activity.clone(),
                attempt: 0,
                enqueued_at: now,
            })
            .collect();

        let ids = match ordering_key {
            None => {
                self.queue
                    .enqueue_many(&messages, EnqueueOptions::new())
                    .await?
            }
            Some(key) => {
                let items: Vec<(OutboxMessage, EnqueueOptions)> = messages
                    .into_iter()
                    .map(|message| {
                        let options = EnqueueOptions::new()
                            .ordering_key(inbox_ordering_key(key, &message.inbox));
                        (message, options)
                    })
                    .collect();
                self.queue.enqueue_each(&items).await?
            }
        };

        tracing::info!(
            activity_id = %activity_id,
            activity_type = %activity_type,
            inboxes = ids.len(),
            total_targets,
            "Activity queued for delivery"
        );
        Ok(ids)
    }
}

fn inbox_ordering_key(key: &str, inbox: &Url) -> String {
    format!("{key}\n{inbox}")
}

fn delivered_marker(message: &OutboxMessage) -> KvKey {
    KvKey::new([
        "outbox",
        "delivered",
        message.activity_id.as_str(),
        message.inbox.as_str(),
    ])
}

/// Handler that delivers [`OutboxMessage`]s
pub struct OutboxWorker<D> {
    queue: Arc<MessageQueue>,
    deliverer: D,
    kv: Option<Arc<KvStore>>,
    retry: RetryPolicy,
}

impl<D: InboxDeliverer> OutboxWorker<D> {
    pub fn new(queue: Arc<MessageQueue>, deliverer: D, retry: RetryPolicy) -> Self {
        Self {
            queue,
            deliverer,
            kv: None,
            retry,
        }
    }

    /// Remember successful deliveries and skip redelivered duplicates
    pub fn with_kv(mut self, kv: Arc<KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Deliver one queued message
    ///
    /// Failures are retried by the backend when it supports native retry;
    /// otherwise a new message with `attempt + 1` is enqueued after the
    /// backoff delay, until the retry budget runs out.
    pub async fn process(&self, envelope: Envelope) -> std::result::Result<(), HandlerError> {
        let message: OutboxMessage = envelope.decode()?;
        let marker = delivered_marker(&message);

        if self.already_delivered(&marker, &message).await {
            tracing::debug!(
                activity_id = %message.activity_id,
                inbox = %message.inbox,
                "Activity already delivered to inbox; skipping"
            );
            FEDERATION_DELIVERIES_TOTAL
                .with_label_values(&["duplicate"])
                .inc();
            return Ok(());
        }

        match self
            .deliverer
            .deliver(&message.inbox, &message.activity)
            .await
        {
            Ok(()) => {
                FEDERATION_DELIVERIES_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                self.mark_delivered(&marker, &message).await;
                Ok(())
            }
            Err(error) => {
                FEDERATION_DELIVERIES_TOTAL
                    .with_label_values(&["failure"])
                    .inc();
                if !error.is_transient() {
                    FEDERATION_DELIVERIES_TOTAL
                        .with_label_values(&["abandoned"])
                        .inc();
                    tracing::error!(
                        activity_id = %message.activity_id,
                        inbox = %message.inbox,
                        error_kind = error.kind(),
                        %error,
                        "Activity delivery failed permanently; not retrying"
                    );
                    return Ok(());
                }
                if self.queue.native_retry() {
                    return Err(Box::new(error));
                }
                self.schedule_retry(&envelope, message, &error).await
            }
        }
    }

    /// A failed lookup counts as "not delivered": a duplicate POST is
    /// preferable to losing the activity.
    async fn already_delivered(&self, marker: &KvKey, message: &OutboxMessage) -> bool {
        let Some(kv) = &self.kv else {
            return false;
        };

        match kv.get(marker).await {
            Ok(found) => found.is_some(),
            Err(error) => {
                tracing::warn!(
                    activity_id = %message.activity_id,
                    inbox = %message.inbox,
                    %error,
                    "Delivery marker lookup failed; delivering anyway"
                );
                false
            }
        }
    }

    /// The POST already succeeded, so a failed write is only logged.
    async fn mark_delivered(&self, marker: &KvKey, message: &OutboxMessage) {
        let Some(kv) = &self.kv else {
            return;
        };

        let delivered_at = self.queue.backend().clock().now();
        if let Err(error) = kv
            .set(
                marker,
                json!({ "delivered_at": delivered_at }),
                Some(DELIVERED_MARKER_TTL),
            )
            .await
        {
            tracing::warn!(
                activity_id = %message.activity_id,
                inbox = %message.inbox,
                %error,
                "Failed to record delivery marker"
            );
        }
    }

    async fn schedule_retry(
        &self,
        envelope: &Envelope,
        message: OutboxMessage,
        error: &QueueError,
    ) -> std::result::Result<(), HandlerError> {
        let attempt = message.attempt.saturating_add(1);

        let Some(delay) = self.retry.next_delay(attempt) else {
            FEDERATION_DELIVERIES_TOTAL
                .with_label_values(&["abandoned"])
                .inc();
            tracing::error!(
                activity_id = %message.activity_id,
                inbox = %message.inbox,
                attempts = attempt,
                %error,
                "Giving up on activity delivery"
            );
            return Ok(());
        };

        // Same key, so the retry stays serialized with its group; it
        // queues behind anything enqueued for that key meanwhile.
        let mut options = EnqueueOptions::new().delay(delay);
        if let Some(key) = &envelope.ordering_key {
            options = options.ordering_key(key.clone());
        }

        let activity_id = message.activity_id.clone();
        let inbox = message.inbox.clone();
        self.queue
            .enqueue(&OutboxMessage { attempt, ..message }, options)
            .await?;

        tracing::warn!(
            activity_id = %activity_id,
            inbox = %inbox,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "Activity delivery failed; retry scheduled"
        );
        Ok(())
    }
}

impl<D: InboxDeliverer + 'static> OutboxWorker<D> {
    /// Adapt the worker for [`MessageQueue::listen`]
    pub fn into_handler(
        self: Arc<Self>,
    ) -> impl Fn(Envelope) -> BoxFuture<'static, std::result::Result<(), HandlerError>>
    + Send
    + Sync
    + 'static {
        move |envelope: Envelope| -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            let worker = Arc::clone(&self);
            Box::pin(async move { worker.process(envelope).await })
        }
    }
}
