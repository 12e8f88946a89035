//! Metrics instrumentation.
//!
//! The server reports through the [`Instrumenter`] trait and never waits on
//! it. [`PrometheusInstrumenter`] keeps the values in a prometheus-client
//! registry for the `/metrics` exporter.

use std::fmt;
use std::time::Instant;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Outcome of one evaluated rule, as reported to metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitStatus {
    Accepted,
    Rejected,
    CanaryAccepted,
    CanaryRejected,
}

impl HitStatus {
    pub fn new(is_allowed: bool, is_canary: bool) -> Self {
        match (is_canary, is_allowed) {
            (false, true) => HitStatus::Accepted,
            (false, false) => HitStatus::Rejected,
            (true, true) => HitStatus::CanaryAccepted,
            (true, false) => HitStatus::CanaryRejected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HitStatus::Accepted => "accepted",
            HitStatus::Rejected => "rejected",
            HitStatus::CanaryAccepted => "canary-accepted",
            HitStatus::CanaryRejected => "canary-rejected",
        }
    }
}

impl fmt::Display for HitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for server metrics.
pub trait Instrumenter: Send + Sync {
    /// Record the current number of open connections.
    fn gauge_current_connections(&self, connections: usize);

    /// Record the duration of a HIT that started at `start`.
    fn time_hit(&self, start: Instant);

    /// Record one evaluated rule.
    fn count_hit(&self, status: HitStatus, rule_label: &str);

    /// Record a protocol error by code.
    fn count_error(&self, code: &str);
}

/// Instrumenter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstrumenter;

impl Instrumenter for NoopInstrumenter {
    fn gauge_current_connections(&self, _connections: usize) {}
    fn time_hit(&self, _start: Instant) {}
    fn count_hit(&self, _status: HitStatus, _rule_label: &str) {}
    fn count_error(&self, _code: &str) {}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct HitLabels {
    status: String,
    rule: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    code: String,
}

/// Instrumenter backed by a prometheus-client registry.
pub struct PrometheusInstrumenter {
    registry: Registry,
    connections: Gauge,
    hit_duration: Histogram,
    hits: Family<HitLabels, Counter>,
    errors: Family<ErrorLabels, Counter>,
}

impl fmt::Debug for PrometheusInstrumenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusInstrumenter").finish_non_exhaustive()
    }
}

impl Default for PrometheusInstrumenter {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusInstrumenter {
    /// Create an instrumenter with all Divvy metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("divvy");

        let connections = Gauge::default();
        registry.register(
            "tcp_connections_total",
            "Total number of open TCP connections to Divvy",
            connections.clone(),
        );

        // 0.5ms up to ~4s
        let hit_duration = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "hit_duration_seconds",
            "Histogram of Divvy processing time for HITs",
            hit_duration.clone(),
        );

        let hits = Family::<HitLabels, Counter>::default();
        registry.register("hits", "Counter of total HITs to Divvy", hits.clone());

        let errors = Family::<ErrorLabels, Counter>::default();
        registry.register("errors", "Counter of total Divvy errors", errors.clone());

        Self {
            registry,
            connections,
            hit_duration,
            hits,
            errors,
        }
    }

    /// Encode all metrics in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Instrumenter for PrometheusInstrumenter {
    fn gauge_current_connections(&self, connections: usize) {
        self.connections.set(connections as i64);
    }

    fn time_hit(&self, start: Instant) {
        self.hit_duration.observe(start.elapsed().as_secs_f64());
    }

    fn count_hit(&self, status: HitStatus, rule_label: &str) {
        self.hits
            .get_or_create(&HitLabels {
                status: status.as_str().to_string(),
                rule: rule_label.to_string(),
            })
            .inc();
    }

    fn count_error(&self, code: &str) {
        self.errors
            .get_or_create(&ErrorLabels {
                code: code.to_string(),
            })
            .inc();
    }
}
