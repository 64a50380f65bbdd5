use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::config::VcsKind;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub vcs: Vcs,
    pub operation: SyncOperation,
    pub outcome: SyncOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncDurationLabels {
    pub vcs: Vcs,
    pub operation: SyncOperation,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Vcs {
    Git,
    Hg,
}

impl From<VcsKind> for Vcs {
    fn from(kind: VcsKind) -> Self {
        match kind {
            VcsKind::Git => Self::Git,
            VcsKind::Hg => Self::Hg,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SyncOperation {
    Clone,
    Update,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SyncOutcome {
    Success,
    Failure,
    Timeout,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- requests --
    pub requests_total: Family<RequestLabels, Counter>,
    pub active_streams: Gauge,

    // -- sync --
    pub sync_total: Family<SyncLabels, Counter>,
    pub sync_duration_seconds: Family<SyncDurationLabels, Histogram>,
    pub cold_waiters: Gauge,

    // -- store --
    pub mirrors_total: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "vcsmirror_requests",
            "Requests handled, by response status",
            requests_total.clone(),
        );

        let active_streams: Gauge = Gauge::default();
        registry.register(
            "vcsmirror_active_streams",
            "Protocol responses currently being streamed",
            active_streams.clone(),
        );

        let sync_total = Family::<SyncLabels, Counter>::default();
        registry.register(
            "vcsmirror_sync",
            "Mirror clone and update operations by outcome",
            sync_total.clone(),
        );

        let sync_duration_seconds =
            Family::<SyncDurationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.1, 2.0, 14))
            });
        registry.register(
            "vcsmirror_sync_duration_seconds",
            "Mirror clone and update latency in seconds",
            sync_duration_seconds.clone(),
        );

        let cold_waiters: Gauge = Gauge::default();
        registry.register(
            "vcsmirror_cold_waiters",
            "Requests currently waiting for an initial clone",
            cold_waiters.clone(),
        );

        let mirrors_total: Gauge = Gauge::default();
        registry.register(
            "vcsmirror_mirrors",
            "Mirror records known to the store",
            mirrors_total.clone(),
        );

        Self {
            requests_total,
            active_streams,
            sync_total,
            sync_duration_seconds,
            cold_waiters,
            mirrors_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

/// Holds a gauge incremented for as long as the guard lives.
pub struct GaugeGuard(Gauge);

impl GaugeGuard {
    pub fn new(gauge: &Gauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
