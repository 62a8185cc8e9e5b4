// src/health/checker.rs
use super::status::{HealthCheck, HealthCheckResult, ProbeFailure};
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, Method};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Anything that can run one health probe. Implementations must never fail:
/// every problem is folded into a failed [`HealthCheckResult`].
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, check: &mut HealthCheck) -> HealthCheckResult;

    /// Most recent results for an endpoint, oldest first.
    fn history(&self, _endpoint_id: &str) -> Vec<HealthCheckResult> {
        Vec::new()
    }

    fn forget(&self, _endpoint_id: &str) {}
}

/// HTTP prober backed by a shared `reqwest` client.
pub struct HealthChecker {
    client: Client,
    history: DashMap<String, VecDeque<HealthCheckResult>>,
    history_size: usize,
    metrics: Option<Arc<MetricsCollector>>,
}

impl HealthChecker {
    pub fn new(
        history_size: usize,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("proxy-traffic-core/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(client, history_size, metrics))
    }

    pub fn with_client(
        client: Client,
        history_size: usize,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            client,
            history: DashMap::new(),
            history_size: history_size.max(1),
            metrics,
        }
    }

    async fn probe(&self, check: &HealthCheck) -> HealthCheckResult {
        let method = match Method::from_bytes(check.method.as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                return HealthCheckResult::failed(
                    check.endpoint_id.clone(),
                    0.0,
                    None,
                    ProbeFailure::Transport {
                        message: e.to_string(),
                    },
                )
            }
        };

        let mut request = self
            .client
            .request(method, check.url.clone())
            .timeout(check.timeout);
        for (name, value) in &check.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &check.body {
            request = request.body(body.clone());
        }

        let start = Instant::now();
        let outcome = timeout(check.timeout, request.send()).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let timed_out = ProbeFailure::Timeout {
            timeout_ms: check.timeout.as_millis() as u64,
        };

        match outcome {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                match check.judge(status, latency_ms) {
                    Ok(()) => {
                        HealthCheckResult::passed(check.endpoint_id.clone(), latency_ms, status)
                    }
                    Err(failure) => HealthCheckResult::failed(
                        check.endpoint_id.clone(),
                        latency_ms,
                        Some(status),
                        failure,
                    ),
                }
            }
            Ok(Err(e)) if e.is_timeout() => {
                HealthCheckResult::failed(check.endpoint_id.clone(), latency_ms, None, timed_out)
            }
            Ok(Err(e)) => HealthCheckResult::failed(
                check.endpoint_id.clone(),
                latency_ms,
                None,
                ProbeFailure::Transport {
                    message: e.to_string(),
                },
            ),
            Err(_) => {
                HealthCheckResult::failed(check.endpoint_id.clone(), latency_ms, None, timed_out)
            }
        }
    }

    fn remember(&self, result: &HealthCheckResult) {
        let mut entries = self
            .history
            .entry(result.endpoint_id.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.history_size));
        if entries.len() == self.history_size {
            entries.pop_front();
        }
        entries.push_back(result.clone());
    }
}

#[async_trait]
impl HealthProbe for HealthChecker {
    async fn check(&self, check: &mut HealthCheck) -> HealthCheckResult {
        let result = self.probe(check).await;

        check.record(&result);
        self.remember(&result);

        if let Some(metrics) = &self.metrics {
            metrics.record_health_check(&result.endpoint_id, result.success, result.latency_ms);
        }

        match &result.error {
            None => debug!(
                endpoint = %result.endpoint_id,
                latency_ms = result.latency_ms,
                "Health check passed"
            ),
            Some(failure) => warn!(
                endpoint = %result.endpoint_id,
                latency_ms = result.latency_ms,
                consecutive_failures = check.consecutive_failures,
                error = %failure,
                "Health check failed"
            ),
        }

        result
    }

    fn history(&self, endpoint_id: &str) -> Vec<HealthCheckResult> {
        self.history
            .get(endpoint_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn forget(&self, endpoint_id: &str) {
        self.history.remove(endpoint_id);
    }
}
