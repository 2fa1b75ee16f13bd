//! Observability infrastructure for the funk agent
//!
//! Provides:
//! - Prometheus metrics (tracked containers, upload batches, send failures, upload latency)
//! - Structured JSON logging of agent lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for batch upload latency (in seconds)
const UPLOAD_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    trackers: IntGauge,
    batches_sent: IntCounter,
    messages_sent: IntCounter,
    send_failures: IntCounter,
    reconnect_attempts: IntCounter,
    dropped_messages: IntCounter,
    log_records: IntCounter,
    normalizer_fallbacks: IntCounter,
    upload_latency_seconds: Histogram,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            trackers: register_int_gauge!(
                "funk_agent_trackers",
                "Number of containers currently tracked"
            )
            .expect("Failed to register trackers"),

            batches_sent: register_int_counter!(
                "funk_agent_batches_sent_total",
                "Batches delivered to the collector"
            )
            .expect("Failed to register batches_sent"),

            messages_sent: register_int_counter!(
                "funk_agent_messages_sent_total",
                "Messages delivered to the collector"
            )
            .expect("Failed to register messages_sent"),

            send_failures: register_int_counter!(
                "funk_agent_send_failures_total",
                "Batch sends that failed"
            )
            .expect("Failed to register send_failures"),

            reconnect_attempts: register_int_counter!(
                "funk_agent_reconnect_attempts_total",
                "Attempts to (re)establish the collector connection"
            )
            .expect("Failed to register reconnect_attempts"),

            dropped_messages: register_int_counter!(
                "funk_agent_dropped_messages_total",
                "Messages discarded after a failed send"
            )
            .expect("Failed to register dropped_messages"),

            log_records: register_int_counter!(
                "funk_agent_log_records_total",
                "Log lines normalized into records"
            )
            .expect("Failed to register log_records"),

            normalizer_fallbacks: register_int_counter!(
                "funk_agent_normalizer_fallbacks_total",
                "Log lines wrapped as plain messages"
            )
            .expect("Failed to register normalizer_fallbacks"),

            upload_latency_seconds: register_histogram!(
                "funk_agent_upload_latency_seconds",
                "Time spent sending one batch to the collector",
                UPLOAD_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register upload_latency_seconds"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn set_trackers(&self, count: usize) {
        self.inner().trackers.set(count as i64);
    }

    /// Record a delivered batch and its latency
    pub fn record_batch_sent(&self, messages: usize, duration_secs: f64) {
        let inner = self.inner();
        inner.batches_sent.inc();
        inner.messages_sent.inc_by(messages as u64);
        inner.upload_latency_seconds.observe(duration_secs);
    }

    pub fn inc_send_failures(&self) {
        self.inner().send_failures.inc();
    }

    pub fn inc_reconnect_attempts(&self) {
        self.inner().reconnect_attempts.inc();
    }

    pub fn add_dropped_messages(&self, count: usize) {
        self.inner().dropped_messages.inc_by(count as u64);
    }

    /// Count one normalized log line
    pub fn record_log_record(&self, used_fallback: bool) {
        let inner = self.inner();
        inner.log_records.inc();
        if used_fallback {
            inner.normalizer_fallbacks.inc();
        }
    }
}

/// Structured logger for agent events
///
/// Emits one consistently shaped event per lifecycle transition so they can
/// be filtered on the `event` field.
#[derive(Clone)]
pub struct StructuredLogger {
    host: String,
}

impl StructuredLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, server: &str, stats_mode: &str) {
        info!(
            event = "agent_started",
            host = %self.host,
            agent_version = %version,
            server = %server,
            stats_mode = %stats_mode,
            "Funk agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            host = %self.host,
            reason = %reason,
            "Funk agent shutting down"
        );
    }

    /// Log a container picked up for tracking
    pub fn log_tracker_started(&self, container_id: &str, container_name: &str) {
        info!(
            event = "tracker_started",
            host = %self.host,
            container_id = %container_id,
            container_name = %container_name,
            "Started tracking container"
        );
    }

    /// Log the state of the collector connection
    pub fn log_connection(&self, connected: bool, server: &str) {
        if connected {
            info!(
                event = "collector_connection",
                host = %self.host,
                connected = true,
                server = %server,
                "Connected to collector"
            );
        } else {
            warn!(
                event = "collector_connection",
                host = %self.host,
                connected = false,
                server = %server,
                "Collector connection lost"
            );
        }
    }

    /// Log a batch dropped after a failed send
    pub fn log_batch_dropped(&self, messages: usize, reconnected: bool, error: &str) {
        warn!(
            event = "batch_dropped",
            host = %self.host,
            messages = messages,
            reconnected = reconnected,
            error = %error,
            "Dropped batch after failed send"
        );
    }

    /// Log a geo database (re)load
    pub fn log_geo_database(&self, path: &str, success: bool) {
        if success {
            info!(
                event = "geoip_database_loaded",
                host = %self.host,
                path = %path,
                "GeoIP database loaded"
            );
        } else {
            warn!(
                event = "geoip_database_failed",
                host = %self.host,
                path = %path,
                "GeoIP database could not be loaded, keeping previous version"
            );
        }
    }
}
