//! Handler invocation
//!
//! A handler that returns an error or panics never takes the listener
//! down. The outcome is logged, counted and handed to the backend; only
//! backends with native retry redeliver it.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use crate::envelope::Envelope;
use crate::metrics::{QUEUE_DELIVERIES_TOTAL, QUEUE_HANDLER_DURATION_SECONDS};
use crate::ordering::{Claim, OrderingSerializer};

/// Error type handlers report failures with
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of delivered envelopes
///
/// Implemented for every `Fn(Envelope) -> impl Future<Output = Result<(), HandlerError>>`.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(envelope))
    }
}

/// How a single handler invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Succeeded,
    Failed(String),
    Panicked(String),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Succeeded => "success",
            DeliveryOutcome::Failed(_) => "failure",
            DeliveryOutcome::Panicked(_) => "panic",
        }
    }
}

/// Run the handler on a claimed envelope, then settle and release
pub(crate) async fn deliver<H>(
    serializer: &OrderingSerializer,
    claim: Claim,
    handler: &H,
) -> DeliveryOutcome
where
    H: MessageHandler + ?Sized,
{
    let envelope = claim.envelope().clone();
    let started = Instant::now();

    // Wrapping the call itself also catches panics raised before the
    // handler returns its future.
    let outcome = match AssertUnwindSafe(async { handler.handle(envelope.clone()).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => DeliveryOutcome::Succeeded,
        Ok(Err(error)) => DeliveryOutcome::Failed(error.to_string()),
        Err(panic) => DeliveryOutcome::Panicked(panic_message(panic.as_ref())),
    };

    QUEUE_HANDLER_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
    QUEUE_DELIVERIES_TOTAL
        .with_label_values(&[outcome.as_str()])
        .inc();

    let native_retry = serializer.backend().native_retry();
    match &outcome {
        DeliveryOutcome::Succeeded => tracing::debug!(
            envelope_id = %envelope.id,
            ordering_key = ?envelope.ordering_key,
            "Envelope delivered"
        ),
        DeliveryOutcome::Failed(reason) | DeliveryOutcome::Panicked(reason) if native_retry => {
            tracing::warn!(
                envelope_id = %envelope.id,
                attempt = envelope.attempt,
                outcome = outcome.as_str(),
                error = %reason,
                "Handler failed; backend will redeliver"
            )
        }
        DeliveryOutcome::Failed(reason) | DeliveryOutcome::Panicked(reason) => tracing::error!(
            envelope_id = %envelope.id,
            ordering_key = ?envelope.ordering_key,
            outcome = outcome.as_str(),
            error = %reason,
            "Handler failed; envelope will not be redelivered"
        ),
    }

    if let Err(error) = serializer.complete(claim, &outcome).await {
        tracing::warn!(
            envelope_id = %envelope.id,
            %error,
            "Failed to settle envelope"
        );
    }

    outcome
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
