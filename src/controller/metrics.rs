//! Prometheus metrics for the machine-api-operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `mao_sync_duration_seconds` (histogram): sync pipeline duration labeled by outcome.
//! - `mao_sync_errors_total` (counter): sync failures labeled by stage and error kind.
//! - `mao_queue_requeues_total` (counter): rate-limited requeues labeled by queue.
//! - `mao_queue_drops_total` (counter): keys dropped after exhausting retries, labeled by queue.
//! - `mao_queue_depth` (gauge): keys waiting in the queue, labeled by queue.
//! - `mao_bootstrap_attempts_total` (counter): bootstrap object creations labeled by object
//!   and outcome.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for sync duration
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    /// "success" or "failure"
    pub outcome: String,
}

/// Labels for sync errors
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncErrorLabels {
    /// Pipeline stage that failed, e.g. "resolve_config"
    pub stage: String,
    /// Error kind/category, e.g. "kube", "config", "images"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub queue: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BootstrapLabels {
    /// "cluster" or "machineset"
    pub object: String,
    /// "created" or "failed"
    pub outcome: String,
}

/// Histogram tracking sync pipeline duration (seconds)
pub static SYNC_DURATION_SECONDS: Lazy<Family<SyncLabels, Histogram>> = Lazy::new(|| {
    fn sync_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(sync_histogram)
});

pub static SYNC_ERRORS_TOTAL: Lazy<Family<SyncErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_REQUEUES_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DROPS_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DEPTH: Lazy<Family<QueueLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static BOOTSTRAP_ATTEMPTS_TOTAL: Lazy<Family<BootstrapLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "mao_sync_duration_seconds",
        "Duration of sync pipeline runs in seconds",
        SYNC_DURATION_SECONDS.clone(),
    );
    registry.register(
        "mao_sync_errors_total",
        "Total number of failed sync pipeline runs",
        SYNC_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "mao_queue_requeues_total",
        "Total number of rate-limited requeues",
        QUEUE_REQUEUES_TOTAL.clone(),
    );
    registry.register(
        "mao_queue_drops_total",
        "Total number of keys dropped after exhausting retries",
        QUEUE_DROPS_TOTAL.clone(),
    );
    registry.register(
        "mao_queue_depth",
        "Number of keys waiting to be processed",
        QUEUE_DEPTH.clone(),
    );
    registry.register(
        "mao_bootstrap_attempts_total",
        "Bootstrap object creation attempts",
        BOOTSTRAP_ATTEMPTS_TOTAL.clone(),
    );

    registry
});

/// Observe a sync duration in seconds.
pub fn observe_sync_duration_seconds(success: bool, seconds: f64) {
    let labels = SyncLabels {
        outcome: if success { "success" } else { "failure" }.to_string(),
    };
    SYNC_DURATION_SECONDS.get_or_create(&labels).observe(seconds);
}

pub fn inc_sync_error(stage: &str, kind: &str) {
    let labels = SyncErrorLabels {
        stage: stage.to_string(),
        kind: kind.to_string(),
    };
    SYNC_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_requeue(queue: &str) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    QUEUE_REQUEUES_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_drop(queue: &str) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    QUEUE_DROPS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_queue_depth(queue: &str, depth: usize) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    QUEUE_DEPTH
        .get_or_create(&labels)
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn inc_bootstrap_attempt(object: &str, created: bool) {
    let labels = BootstrapLabels {
        object: object.to_string(),
        outcome: if created { "created" } else { "failed" }.to_string(),
    };
    BOOTSTRAP_ATTEMPTS_TOTAL.get_or_create(&labels).inc();
}
