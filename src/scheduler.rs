//! Poll scheduling
//!
//! The listener loop: one poll at startup, then a poll per wake-up
//! notification or interval tick. A poll drains every claimable envelope
//! before going idle. Wake-ups that arrive while a poll is running are
//! coalesced into a single follow-up poll, so a burst of enqueues never
//! leaves envelopes sitting until the next interval tick.
//!
//! ```text
//!            startup
//!               │
//!   ┌──────▶ Polling ──(cancel)──▶ Draining ──▶ Stopped
//!   │           │
//!   │   (buffered wake-ups?) ──yes──▶ follow-up poll
//!   │           │ no
//!   │           ▼
//!   └─(notify / tick)── Idle ──(cancel)──▶ Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::Subscription;
use crate::delivery::{self, MessageHandler};
use crate::metrics::{QUEUE_POLLS_TOTAL, record_backend_error};
use crate::ordering::OrderingSerializer;

/// Observable listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
    Draining,
    Stopped,
}

/// Why a poll cycle started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTrigger {
    Startup,
    Notification,
    Interval,
    FollowUp,
}

impl PollTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            PollTrigger::Startup => "startup",
            PollTrigger::Notification => "notification",
            PollTrigger::Interval => "interval",
            PollTrigger::FollowUp => "follow_up",
        }
    }
}

/// Fires when either the caller's token or the queue's shutdown token does
///
/// Both are checked synchronously, so a token cancelled before `listen`
/// starts prevents every claim.
#[derive(Debug, Clone)]
pub(crate) struct StopSignal {
    caller: CancellationToken,
    shutdown: CancellationToken,
}

impl StopSignal {
    pub(crate) fn new(caller: CancellationToken, shutdown: CancellationToken) -> Self {
        Self { caller, shutdown }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.caller.is_cancelled() || self.shutdown.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        tokio::select! {
            () = self.caller.cancelled() => {}
            () = self.shutdown.cancelled() => {}
        }
    }
}

enum Wake {
    Cancelled,
    Notified,
    ChannelClosed,
    Tick,
}

pub(crate) struct Scheduler {
    serializer: OrderingSerializer,
    poll_interval: Duration,
    state: Arc<watch::Sender<SchedulerState>>,
}

impl Scheduler {
    pub(crate) fn new(
        serializer: OrderingSerializer,
        poll_interval: Duration,
        state: Arc<watch::Sender<SchedulerState>>,
    ) -> Self {
        Self {
            serializer,
            poll_interval,
            state,
        }
    }

    /// Run until `stop` fires
    ///
    /// The subscription must be taken before calling so that notifications
    /// sent during the startup poll are not lost.
    pub(crate) async fn run<H>(
        &self,
        handler: &H,
        subscription: Subscription,
        stop: &StopSignal,
    ) where
        H: MessageHandler + ?Sized,
    {
        let mut subscription = Some(subscription);
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut trigger = Some(PollTrigger::Startup);

        loop {
            if let Some(current) = trigger.take() {
                self.set_state(SchedulerState::Polling);
                self.poll(handler, stop, current).await;
                if stop.is_cancelled() {
                    break;
                }
                interval.reset();

                if subscription.as_mut().is_some_and(Subscription::drain) {
                    trigger = Some(PollTrigger::FollowUp);
                    continue;
                }
                self.set_state(SchedulerState::Idle);
            }

            let wake = tokio::select! {
                biased;
                () = stop.cancelled() => Wake::Cancelled,
                woke = next_wakeup(&mut subscription) => {
                    if woke { Wake::Notified } else { Wake::ChannelClosed }
                }
                _ = interval.tick() => Wake::Tick,
            };

            match wake {
                Wake::Cancelled => break,
                Wake::Notified => trigger = Some(PollTrigger::Notification),
                Wake::Tick => trigger = Some(PollTrigger::Interval),
                Wake::ChannelClosed => {
                    tracing::warn!("Wake-up channel closed; falling back to interval polling");
                    subscription = None;
                }
            }
        }

        self.set_state(SchedulerState::Stopped);
    }

    /// Claim and deliver until nothing is claimable
    async fn poll<H>(&self, handler: &H, stop: &StopSignal, trigger: PollTrigger)
    where
        H: MessageHandler + ?Sized,
    {
        QUEUE_POLLS_TOTAL
            .with_label_values(&[trigger.as_str()])
            .inc();

        let mut delivered = 0usize;
        loop {
            if stop.is_cancelled() {
                self.set_state(SchedulerState::Draining);
                break;
            }

            let claim = match self.serializer.claim().await {
                Ok(Some(claim)) => claim,
                Ok(None) => break,
                Err(error) => {
                    record_backend_error("claim");
                    tracing::warn!(
                        worker = %self.serializer.worker(),
                        trigger = trigger.as_str(),
                        %error,
                        "Claim failed; will retry on next wake-up"
                    );
                    break;
                }
            };

            delivery::deliver(&self.serializer, claim, handler).await;
            delivered += 1;
        }

        if delivered > 0 {
            tracing::debug!(
                worker = %self.serializer.worker(),
                trigger = trigger.as_str(),
                delivered,
                "Poll cycle finished"
            );
        }
    }

    fn set_state(&self, state: SchedulerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!(from = ?previous, to = ?state, "Scheduler state changed");
        }
    }
}

async fn next_wakeup(subscription: &mut Option<Subscription>) -> bool {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::clock::{Clock, SystemClock};
    use crate::delivery::HandlerError;
    use crate::envelope::{EnqueueOptions, Envelope, WorkerId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler(backend: Arc<Backend>, poll_interval: Duration) -> Scheduler {
        Scheduler::new(
            OrderingSerializer::new(backend, WorkerId::new("w")),
            poll_interval,
            Arc::new(watch::channel(SchedulerState::Stopped).0),
        )
    }

    fn stop_on(cancel: &CancellationToken) -> StopSignal {
        StopSignal::new(cancel.clone(), CancellationToken::new())
    }

    fn memory_backend() -> Arc<Backend> {
        Arc::new(Backend::Memory(MemoryBackend::new(
            Arc::new(SystemClock),
            Duration::from_secs(30),
        )))
    }

    #[tokio::test]
    async fn test_startup_poll_drains_backlog() {
        let backend = memory_backend();
        for i in 0..5 {
            let envelope =
                Envelope::encode(&i, &EnqueueOptions::new(), backend.clock().now()).unwrap();
            backend.insert(&envelope).await.unwrap();
        }

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let handler = move |_envelope: Envelope| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        };

        // Long interval: only the startup poll can deliver.
        let scheduler = scheduler(Arc::clone(&backend), Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let subscription = backend.subscribe();

        let stopper = cancel.clone();
        let watcher = Arc::clone(&delivered);
        tokio::spawn(async move {
            while watcher.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run(&handler, subscription, &stop_on(&cancel)),
        )
        .await
        .expect("scheduler did not stop");

        assert_eq!(delivered.load(Ordering::SeqCst), 5);
        assert_eq!(*scheduler.state.borrow(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_notification_triggers_poll() {
        let backend = memory_backend();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let handler = move |_envelope: Envelope| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        };

        let scheduler = scheduler(Arc::clone(&backend), Duration::from_secs(3600));
        let mut states = scheduler.state.subscribe();
        let cancel = CancellationToken::new();
        let subscription = backend.subscribe();

        let producer = Arc::clone(&backend);
        let stopper = cancel.clone();
        let watcher = Arc::clone(&delivered);
        tokio::spawn(async move {
            states
                .wait_for(|state| *state == SchedulerState::Idle)
                .await
                .unwrap();
            let envelope =
                Envelope::encode("late", &EnqueueOptions::new(), producer.clock().now())
                    .unwrap();
            producer.insert(&envelope).await.unwrap();
            producer.notify();

            while watcher.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run(&handler, subscription, &stop_on(&cancel)),
        )
        .await
        .expect("notification was not picked up");

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_pre_cancelled_token_claims_nothing() {
        let backend = memory_backend();
        for i in 0..5 {
            let envelope =
                Envelope::encode(&i, &EnqueueOptions::new(), backend.clock().now()).unwrap();
            backend.insert(&envelope).await.unwrap();
        }

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let handler = move |_envelope: Envelope| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        };

        let scheduler = scheduler(Arc::clone(&backend), Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();

        scheduler
            .run(&handler, backend.subscribe(), &stop_on(&cancel))
            .await;

        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(backend.pending_count().await.unwrap(), 5);
        assert_eq!(*scheduler.state.borrow(), SchedulerState::Stopped);
    }

    #[test]
    fn test_stop_signal_watches_both_tokens() {
        let caller = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let stop = StopSignal::new(caller.clone(), shutdown.clone());
        assert!(!stop.is_cancelled());

        shutdown.cancel();
        assert!(stop.is_cancelled());
        assert!(!caller.is_cancelled());
    }

    #[test]
    fn test_trigger_labels() {
        assert_eq!(PollTrigger::Startup.as_str(), "startup");
        assert_eq!(PollTrigger::FollowUp.as_str(), "follow_up");
    }
}
