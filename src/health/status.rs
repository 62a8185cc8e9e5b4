// src/health/status.rs
use crate::endpoint::Endpoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Failover-governing verdict for an endpoint.
///
/// `Healthy < Degraded < Unhealthy < Offline` by severity; `Unknown` sits
/// outside that order and is only ever the state before the first check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl HealthStatus {
    pub fn severity(&self) -> Option<u8> {
        match self {
            HealthStatus::Unknown => None,
            HealthStatus::Healthy => Some(0),
            HealthStatus::Degraded => Some(1),
            HealthStatus::Unhealthy => Some(2),
            HealthStatus::Offline => Some(3),
        }
    }

    /// One level toward `Healthy`.
    pub fn recovered(&self) -> HealthStatus {
        match self {
            HealthStatus::Offline => HealthStatus::Unhealthy,
            HealthStatus::Unhealthy => HealthStatus::Degraded,
            HealthStatus::Degraded | HealthStatus::Healthy => HealthStatus::Healthy,
            HealthStatus::Unknown => HealthStatus::Unknown,
        }
    }

    /// Endpoints in these states are excluded from routing.
    pub fn is_failed(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::Offline)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "UNKNOWN",
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
            HealthStatus::Offline => "OFFLINE",
        }
    }

    /// Gauge encoding for metrics (0 = unknown .. 4 = offline).
    pub fn as_gauge(&self) -> i64 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
            HealthStatus::Offline => 4,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a probe did not count as a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeFailure {
    #[error("unexpected status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("too slow: {latency_ms}ms exceeds {limit_ms}ms")]
    TooSlow { latency_ms: u64, limit_ms: u64 },

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport error: {message}")]
    Transport { message: String },
}

/// The probe definition for one endpoint plus its running counters.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub endpoint_id: String,
    pub url: Url,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub expected_status: Vec<u16>,
    pub expected_max_latency_ms: u64,

    pub total_checks: u64,
    pub successful_checks: u64,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<f64>,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
}

impl HealthCheck {
    pub fn for_endpoint(endpoint: &Endpoint) -> Result<Self, url::ParseError> {
        let settings = &endpoint.health_check;
        Ok(Self {
            endpoint_id: endpoint.id.clone(),
            url: endpoint.url.join(&settings.path)?,
            method: settings.method.clone(),
            headers: settings.headers.clone(),
            body: settings.body.clone(),
            timeout: settings.probe_timeout(),
            expected_status: settings.expected_status.clone(),
            expected_max_latency_ms: settings.expected_max_latency_ms,
            total_checks: 0,
            successful_checks: 0,
            consecutive_failures: 0,
            last_check_at: None,
            last_latency_ms: None,
            last_status_code: None,
            last_error: None,
        })
    }

    /// Lifetime successful / total ratio, `None` before the first check.
    pub fn availability(&self) -> Option<f64> {
        if self.total_checks == 0 {
            None
        } else {
            Some(self.successful_checks as f64 / self.total_checks as f64)
        }
    }

    /// Pure pass/fail judgment for a completed HTTP exchange.
    pub fn judge(&self, status: u16, latency_ms: f64) -> Result<(), ProbeFailure> {
        if !self.expected_status.contains(&status) {
            return Err(ProbeFailure::UnexpectedStatus { status });
        }
        if latency_ms > self.expected_max_latency_ms as f64 {
            return Err(ProbeFailure::TooSlow {
                latency_ms: latency_ms.round() as u64,
                limit_ms: self.expected_max_latency_ms,
            });
        }
        Ok(())
    }

    pub fn record(&mut self, result: &HealthCheckResult) {
        self.total_checks += 1;
        if result.success {
            self.successful_checks += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        self.last_check_at = Some(result.checked_at);
        self.last_latency_ms = Some(result.latency_ms);
        self.last_status_code = result.status_code;
        self.last_error = result.error.as_ref().map(ToString::to_string);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub endpoint_id: String,
    pub success: bool,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    pub error: Option<ProbeFailure>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn passed(endpoint_id: impl Into<String>, latency_ms: f64, status_code: u16) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            success: true,
            latency_ms,
            status_code: Some(status_code),
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn failed(
        endpoint_id: impl Into<String>,
        latency_ms: f64,
        status_code: Option<u16>,
        error: ProbeFailure,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            success: false,
            latency_ms,
            status_code,
            error: Some(error),
            checked_at: Utc::now(),
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check() -> HealthCheck {
        let endpoint = Endpoint::new("a", Url::parse("http://10.0.0.1:8080/").unwrap());
        HealthCheck::for_endpoint(&endpoint).unwrap()
    }

    #[test]
    fn test_url_joins_health_path() {
        assert_eq!(check().url.as_str(), "http://10.0.0.1:8080/health");
    }

    #[test]
    fn test_judge_distinguishes_status_and_latency() {
        let hc = check();
        assert_eq!(hc.judge(200, 10.0), Ok(()));
        assert_eq!(
            hc.judge(503, 10.0),
            Err(ProbeFailure::UnexpectedStatus { status: 503 })
        );
        assert_eq!(
            hc.judge(200, 6_000.0),
            Err(ProbeFailure::TooSlow {
                latency_ms: 6_000,
                limit_ms: 5_000
            })
        );
    }

    #[test]
    fn test_record_updates_counters() {
        let mut hc = check();
        hc.record(&HealthCheckResult::passed("a", 12.0, 200));
        hc.record(&HealthCheckResult::failed(
            "a",
            3.0,
            None,
            ProbeFailure::Transport {
                message: "connection refused".into(),
            },
        ));

        assert_eq!(hc.total_checks, 2);
        assert_eq!(hc.successful_checks, 1);
        assert_eq!(hc.consecutive_failures, 1);
        assert_eq!(hc.availability(), Some(0.5));
        assert_eq!(
            hc.last_error.as_deref(),
            Some("transport error: connection refused")
        );
    }

    #[test]
    fn test_recovery_steps_one_level() {
        assert_eq!(HealthStatus::Offline.recovered(), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::Unhealthy.recovered(), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Degraded.recovered(), HealthStatus::Healthy);
    }
}
