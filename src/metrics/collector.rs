// src/metrics/collector.rs
use crate::health::HealthStatus;
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Health checks
    pub health_checks_total: IntCounterVec,
    pub health_check_duration_seconds: HistogramVec,
    pub endpoint_health_status: IntGaugeVec,
    pub status_transitions_total: IntCounterVec,

    // Failover
    pub failovers_total: IntCounterVec,
    pub no_fallback_total: IntCounterVec,

    // Load balancing
    pub selections_total: IntCounterVec,
    pub selections_unavailable_total: IntCounterVec,
    pub endpoint_connections_active: IntGaugeVec,
    pub endpoint_active: IntGaugeVec,

    // Cache
    pub cache_lookups_total: IntCounterVec,
    pub cache_sets_total: IntCounter,
    pub cache_invalidated_total: IntCounterVec,
    pub cache_bytes_stored: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let health_checks_total = IntCounterVec::new(
            Opts::new("ptc_health_checks_total", "Total health probes"),
            &["endpoint", "outcome"],
        )?;
        registry.register(Box::new(health_checks_total.clone()))?;

        let health_check_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ptc_health_check_duration_seconds",
                "Health probe latency in seconds",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(health_check_duration_seconds.clone()))?;

        let endpoint_health_status = IntGaugeVec::new(
            Opts::new(
                "ptc_endpoint_health_status",
                "Endpoint health status (0=unknown, 1=healthy, 2=degraded, 3=unhealthy, 4=offline)",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(endpoint_health_status.clone()))?;

        let status_transitions_total = IntCounterVec::new(
            Opts::new(
                "ptc_status_transitions_total",
                "Health status transitions by target status",
            ),
            &["endpoint", "status"],
        )?;
        registry.register(Box::new(status_transitions_total.clone()))?;

        let failovers_total = IntCounterVec::new(
            Opts::new("ptc_failovers_total", "Failovers to a healthy fallback"),
            &["primary"],
        )?;
        registry.register(Box::new(failovers_total.clone()))?;

        let no_fallback_total = IntCounterVec::new(
            Opts::new(
                "ptc_no_healthy_fallback_total",
                "Failover attempts that found no healthy fallback",
            ),
            &["primary"],
        )?;
        registry.register(Box::new(no_fallback_total.clone()))?;

        let selections_total = IntCounterVec::new(
            Opts::new("ptc_selections_total", "Endpoint selections"),
            &["group", "algorithm", "endpoint"],
        )?;
        registry.register(Box::new(selections_total.clone()))?;

        let selections_unavailable_total = IntCounterVec::new(
            Opts::new(
                "ptc_selections_unavailable_total",
                "Selections that found no active endpoint",
            ),
            &["group"],
        )?;
        registry.register(Box::new(selections_unavailable_total.clone()))?;

        let endpoint_connections_active = IntGaugeVec::new(
            Opts::new(
                "ptc_endpoint_connections_active",
                "Open connections per endpoint",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(endpoint_connections_active.clone()))?;

        let endpoint_active = IntGaugeVec::new(
            Opts::new(
                "ptc_endpoint_active",
                "Whether the load balancer routes to the endpoint (1=yes, 0=no)",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(endpoint_active.clone()))?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new("ptc_cache_lookups_total", "Response cache lookups"),
            &["endpoint", "result"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let cache_sets_total = IntCounter::new("ptc_cache_sets_total", "Responses written to cache")?;
        registry.register(Box::new(cache_sets_total.clone()))?;

        let cache_invalidated_total = IntCounterVec::new(
            Opts::new(
                "ptc_cache_invalidated_total",
                "Cache entries removed by invalidation",
            ),
            &["endpoint", "type"],
        )?;
        registry.register(Box::new(cache_invalidated_total.clone()))?;

        let cache_bytes_stored = IntGauge::new(
            "ptc_cache_bytes_stored",
            "Total bytes written to the response cache",
        )?;
        registry.register(Box::new(cache_bytes_stored.clone()))?;

        Ok(Self {
            health_checks_total,
            health_check_duration_seconds,
            endpoint_health_status,
            status_transitions_total,
            failovers_total,
            no_fallback_total,
            selections_total,
            selections_unavailable_total,
            endpoint_connections_active,
            endpoint_active,
            cache_lookups_total,
            cache_sets_total,
            cache_invalidated_total,
            cache_bytes_stored,
        })
    }

    pub fn record_health_check(&self, endpoint: &str, success: bool, latency_ms: f64) {
        let outcome = if success { "success" } else { "failure" };
        self.health_checks_total
            .with_label_values(&[endpoint, outcome])
            .inc();

        self.health_check_duration_seconds
            .with_label_values(&[endpoint])
            .observe(latency_ms / 1000.0);
    }

    pub fn record_status(&self, endpoint: &str, status: HealthStatus) {
        self.set_health_status(endpoint, status);
        self.status_transitions_total
            .with_label_values(&[endpoint, status.as_str()])
            .inc();
    }

    pub fn set_health_status(&self, endpoint: &str, status: HealthStatus) {
        self.endpoint_health_status
            .with_label_values(&[endpoint])
            .set(status.as_gauge());
    }

    pub fn record_failover(&self, primary: &str, found_fallback: bool) {
        if found_fallback {
            self.failovers_total.with_label_values(&[primary]).inc();
        } else {
            self.no_fallback_total.with_label_values(&[primary]).inc();
        }
    }

    pub fn record_selection(&self, group: &str, algorithm: &str, endpoint: Option<&str>) {
        match endpoint {
            Some(endpoint) => self
                .selections_total
                .with_label_values(&[group, algorithm, endpoint])
                .inc(),
            None => self
                .selections_unavailable_total
                .with_label_values(&[group])
                .inc(),
        }
    }

    pub fn update_endpoint_load(&self, endpoint: &str, connections: u64, active: bool) {
        self.endpoint_connections_active
            .with_label_values(&[endpoint])
            .set(connections as i64);
        self.endpoint_active
            .with_label_values(&[endpoint])
            .set(if active { 1 } else { 0 });
    }

    pub fn record_cache_lookup(&self, endpoint: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total
            .with_label_values(&[endpoint, result])
            .inc();
    }

    pub fn record_cache_set(&self, total_bytes_stored: u64) {
        self.cache_sets_total.inc();
        self.cache_bytes_stored.set(total_bytes_stored as i64);
    }

    pub fn record_invalidation(&self, endpoint: &str, kind: &str, affected: usize) {
        self.cache_invalidated_total
            .with_label_values(&[endpoint, kind])
            .inc_by(affected as u64);
    }

    /// Drops label sets for an endpoint that is no longer registered.
    pub fn forget_endpoint(&self, endpoint: &str) {
        let _ = self.endpoint_health_status.remove_label_values(&[endpoint]);
        let _ = self.endpoint_connections_active.remove_label_values(&[endpoint]);
        let _ = self.endpoint_active.remove_label_values(&[endpoint]);
    }
}
