//! Controller metrics
//!
//! Reconciliation, queue, tracker and config-write metrics, all registered
//! on [`CONTROLLER_METRICS_REGISTRY`] and served by the metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Service reconciliation duration
    static ref SERVICE_RECONCILIATION_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "cflb_service_reconciliation_duration_seconds",
            "Service reconciliation duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["transition"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Service reconciliations total
    static ref SERVICE_RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "cflb_service_reconciliations_total",
            "Total number of service reconciliations",
        );
        let counter = IntCounterVec::new(opts, &["namespace", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Keys re-enqueued with backoff after a failed reconciliation
    static ref QUEUE_RETRIES_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "cflb_queue_retries_total",
            "Total number of rate limited requeues",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Keys dropped after exhausting retries (or with a malformed key)
    static ref QUEUE_DROPS_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "cflb_queue_drops_total",
            "Total number of keys dropped out of the queue",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Keys waiting in the queue
    static ref QUEUE_DEPTH: IntGauge = {
        let gauge = IntGauge::new("cflb_queue_depth", "Number of keys pending in the queue")
            .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Services currently exposed through the tunnel
    static ref TRACKED_INGRESSES: IntGauge = {
        let gauge = IntGauge::new(
            "cflb_tracked_ingresses",
            "Number of services with an assigned tunnel hostname",
        )
        .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// cloudflared configuration sync attempts
    static ref CONFIG_WRITES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "cflb_config_writes_total",
            "Total number of cloudflared configuration syncs",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record a Service reconciliation
pub fn record_service_reconciliation(
    namespace: &str,
    transition: &str,
    duration_secs: f64,
    result: &str,
) {
    SERVICE_RECONCILIATION_DURATION
        .with_label_values(&[transition])
        .observe(duration_secs);

    SERVICE_RECONCILIATIONS_TOTAL
        .with_label_values(&[namespace, result])
        .inc();
}

pub fn record_queue_retry() {
    QUEUE_RETRIES_TOTAL.inc();
}

pub fn record_queue_drop() {
    QUEUE_DROPS_TOTAL.inc();
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as i64);
}

/// Handle on the tracked ingresses gauge
pub fn tracked_ingresses_gauge() -> IntGauge {
    TRACKED_INGRESSES.clone()
}

/// Record a config sync outcome: "written", "unchanged" or "error"
pub fn record_config_write(result: &str) {
    CONFIG_WRITES_TOTAL.with_label_values(&[result]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}
