//! ActivityPub outbound delivery
//!
//! Handles:
//! - Fan-out of an activity into per-inbox queue messages
//! - Delivery of queued messages to remote inboxes
//! - Retry with backoff and duplicate suppression

mod deliverer;
mod outbox;

pub use deliverer::{HttpDeliverer, InboxDeliverer, RequestSigner};
pub use outbox::{Outbox, OutboxMessage, OutboxWorker};
