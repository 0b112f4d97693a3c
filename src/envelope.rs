//! Envelope codec
//!
//! An [`Envelope`] wraps a caller payload with delivery metadata so that
//! every backend can store and order it the same way. The ordering key
//! travels beside the payload, never inside it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use ulid::Ulid;

use crate::clock;
use crate::error::QueueError;

/// Unique envelope identifier (ULID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvelopeId(Ulid);

impl EnvelopeId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EnvelopeId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| QueueError::Validation(format!("invalid envelope id {s:?}: {e}")))
    }
}

/// Identity of one listening worker
///
/// Used as ordering-lock owner. Must be unique per listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identity (`worker-<ulid>`)
    pub fn random() -> Self {
        Self(format!("worker-{}", Ulid::new().to_string().to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options accepted by `enqueue` / `enqueue_many`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the envelope becomes visible
    pub delay: Option<Duration>,
    /// Envelopes sharing a key are processed one at a time, in order
    pub ordering_key: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    /// Whether envelopes enqueued with these options are due immediately
    pub fn is_immediate(&self) -> bool {
        self.delay.is_none_or(|delay| delay.is_zero())
    }
}

/// Stored message plus delivery metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub payload: serde_json::Value,
    pub ordering_key: Option<String>,
    /// Must not be claimed before this instant (millisecond resolution)
    pub visible_at: DateTime<Utc>,
    /// Assigned by the backend on insert; `None` until stored
    pub sequence: Option<i64>,
    /// Delivery attempts already made (native-retry backends only)
    pub attempt: u32,
}

impl Envelope {
    /// Wrap a payload for storage
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized or the delay
    /// overflows the representable time range
    pub fn encode<T: Serialize + ?Sized>(
        payload: &T,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let visible_at = match options.delay {
            Some(delay) => clock::add_delay(now, delay).ok_or_else(|| {
                QueueError::Validation(format!("delay {delay:?} is out of range"))
            })?,
            None => now,
        };

        if let Some(key) = &options.ordering_key {
            if key.is_empty() {
                return Err(QueueError::Validation(
                    "ordering key must not be empty".to_string(),
                ));
            }
        }

        Ok(Self {
            id: EnvelopeId::new(),
            payload,
            ordering_key: options.ordering_key.clone(),
            visible_at: clock::truncate_millis(visible_at),
            sequence: None,
            attempt: 0,
        })
    }

    /// Decode the payload into a concrete type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(T::deserialize(&self.payload)?)
    }

    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }
}
