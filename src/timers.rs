//! Delayed wake-up timers
//!
//! Each delayed enqueue arms one timer that nudges local listeners when
//! the envelope becomes visible. Timers live in a registry so that
//! shutdown can cancel whatever is still pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::metrics::QUEUE_TIMERS_PENDING;

#[derive(Default)]
struct TimerState {
    next_id: u64,
    timers: HashMap<u64, JoinHandle<()>>,
    closed: bool,
}

/// Registry of pending one-shot timers
#[derive(Default)]
pub struct TimerRegistry {
    state: Arc<Mutex<TimerState>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay` unless cancelled first
    ///
    /// Ignored once the registry is closed.
    pub async fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().await;
        if state.closed {
            tracing::debug!("Timer registry closed; wake-up not scheduled");
            return;
        }

        state.next_id += 1;
        let id = state.next_id;
        let registry = Arc::clone(&self.state);

        // Spawned while the lock is held, so the timer's own removal
        // always runs after the insert below.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if registry.lock().await.timers.remove(&id).is_some() {
                QUEUE_TIMERS_PENDING.dec();
            }
            action();
        });

        state.timers.insert(id, handle);
        QUEUE_TIMERS_PENDING.inc();
    }

    /// Abort every pending timer; the registry stays usable
    pub async fn cancel_all(&self) {
        let mut state = self.state.lock().await;
        let cancelled = state.timers.len();

        for (_, handle) in state.timers.drain() {
            handle.abort();
            QUEUE_TIMERS_PENDING.dec();
        }

        if cancelled > 0 {
            tracing::debug!(cancelled, "Pending wake-up timers cancelled");
        }
    }

    /// Cancel everything and refuse new timers
    pub async fn close(&self) {
        self.cancel_all().await;
        self.state.lock().await.closed = true;
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.timers.len()
    }
}
