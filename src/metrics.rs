//! Prometheus metrics registry and instruments.
//!
//! Instruments work whether or not they are registered; `init_metrics`
//! only makes them visible through `render_metrics`.

use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Queue Metrics
    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("resort_queue_enqueued_total", "Total number of envelopes enqueued"),
        &["backend"]
    ).expect("metric can be created");
    pub static ref QUEUE_CLAIMED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("resort_queue_claimed_total", "Total number of envelopes claimed"),
        &["backend"]
    ).expect("metric can be created");
    pub static ref QUEUE_DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("resort_queue_deliveries_total", "Total number of handler invocations"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref QUEUE_POLLS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("resort_queue_polls_total", "Total number of poll cycles"),
        &["trigger"]
    ).expect("metric can be created");
    pub static ref QUEUE_BACKEND_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("resort_queue_backend_errors_total", "Total number of failed backend operations"),
        &["operation"]
    ).expect("metric can be created");
    pub static ref QUEUE_HANDLER_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "resort_queue_handler_duration_seconds",
            "Handler execution time in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0])
    ).expect("metric can be created");
    pub static ref ORDERING_LEASES_HELD: IntGauge = IntGauge::new(
        "resort_queue_ordering_leases_held",
        "Ordering leases currently held by this process"
    ).expect("metric can be created");
    pub static ref QUEUE_TIMERS_PENDING: IntGauge = IntGauge::new(
        "resort_queue_timers_pending",
        "Outstanding delayed wake-up timers"
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref FEDERATION_DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("resort_queue_federation_deliveries_total", "Total number of inbox deliveries"),
        &["status"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Safe to call more than once; repeated registrations are ignored.
pub fn init_metrics() {
    let collectors: Vec<(&str, Box<dyn Collector>)> = vec![
        ("QUEUE_ENQUEUED_TOTAL", Box::new(QUEUE_ENQUEUED_TOTAL.clone())),
        ("QUEUE_CLAIMED_TOTAL", Box::new(QUEUE_CLAIMED_TOTAL.clone())),
        ("QUEUE_DELIVERIES_TOTAL", Box::new(QUEUE_DELIVERIES_TOTAL.clone())),
        ("QUEUE_POLLS_TOTAL", Box::new(QUEUE_POLLS_TOTAL.clone())),
        (
            "QUEUE_BACKEND_ERRORS_TOTAL",
            Box::new(QUEUE_BACKEND_ERRORS_TOTAL.clone()),
        ),
        (
            "QUEUE_HANDLER_DURATION_SECONDS",
            Box::new(QUEUE_HANDLER_DURATION_SECONDS.clone()),
        ),
        ("ORDERING_LEASES_HELD", Box::new(ORDERING_LEASES_HELD.clone())),
        ("QUEUE_TIMERS_PENDING", Box::new(QUEUE_TIMERS_PENDING.clone())),
        (
            "FEDERATION_DELIVERIES_TOTAL",
            Box::new(FEDERATION_DELIVERIES_TOTAL.clone()),
        ),
    ];

    for (name, collector) in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(error) => tracing::warn!(metric = name, %error, "Failed to register metric"),
        }
    }

    tracing::info!("Metrics registry initialized");
}

/// Render the registry in the Prometheus text format
pub fn render_metrics() -> Result<String, crate::error::QueueError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| crate::error::QueueError::Internal(e.into()))?;
    String::from_utf8(buffer).map_err(|e| crate::error::QueueError::Internal(e.into()))
}

/// Count a failed backend operation
pub(crate) fn record_backend_error(operation: &str) {
    QUEUE_BACKEND_ERRORS_TOTAL
        .with_label_values(&[operation])
        .inc();
}
