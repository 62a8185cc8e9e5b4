// src/endpoint/load.rs
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Endpoints whose local health score falls below this stop receiving traffic.
pub const INACTIVE_SCORE_THRESHOLD: f64 = 20.0;

/// How long a failure counts as recent. Also how long a locally
/// deactivated endpoint sits out before it is given a fresh window.
pub const RECENT_FAILURE_WINDOW_MINUTES: i64 = 5;

/// Runtime request counters for one endpoint. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointLoad {
    pub endpoint_id: String,
    pub current_connections: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_response_time_ms: f64,
    pub avg_response_time_ms: f64,
    pub last_access: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub health_score: f64,
    pub active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl EndpointLoad {
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            current_connections: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            total_response_time_ms: 0.0,
            avg_response_time_ms: 0.0,
            last_access: None,
            last_success: None,
            last_failure: None,
            health_score: 100.0,
            active: true,
            deactivated_at: None,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }

    /// Connection counts saturate at zero; a stray extra decrement is not an error.
    pub fn apply_connections_delta(&mut self, delta: i64) {
        self.current_connections = if delta >= 0 {
            self.current_connections.saturating_add(delta as u64)
        } else {
            self.current_connections.saturating_sub(delta.unsigned_abs())
        };
    }

    /// Folds one completed request into the counters and re-derives the
    /// health score. Returns `true` when this call deactivated the endpoint.
    pub fn record_completion(
        &mut self,
        response_time_ms: f64,
        success: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let response_time_ms = response_time_ms.max(0.0);

        self.total_requests += 1;
        self.total_response_time_ms += response_time_ms;
        self.avg_response_time_ms = self.total_response_time_ms / self.total_requests as f64;
        self.last_access = Some(now);

        if success {
            self.successful_requests += 1;
            self.last_success = Some(now);
        } else {
            self.failed_requests += 1;
            self.last_failure = Some(now);
        }

        self.health_score = self.penalty_score(now).clamp(0.0, 100.0);

        if self.active && self.health_score < INACTIVE_SCORE_THRESHOLD {
            self.active = false;
            self.deactivated_at = Some(now);
            return true;
        }
        false
    }

    /// Starts a fresh accounting window. Open connections are kept.
    pub fn reactivate(&mut self) {
        let connections = self.current_connections;
        let last_access = self.last_access;
        *self = Self::new(std::mem::take(&mut self.endpoint_id));
        self.current_connections = connections;
        self.last_access = last_access;
    }

    /// `true` once a deactivated endpoint has sat out the recent-failure window.
    pub fn deactivation_expired(&self, now: DateTime<Utc>) -> bool {
        self.deactivated_at.is_some_and(|at| {
            now.signed_duration_since(at) >= Duration::minutes(RECENT_FAILURE_WINDOW_MINUTES)
        })
    }

    /// 100 minus connection, latency, error-rate and recent-failure
    /// penalties. Unclamped.
    pub fn penalty_score(&self, now: DateTime<Utc>) -> f64 {
        let mut score = 100.0;

        if self.current_connections > 100 {
            score -= 20.0;
        } else if self.current_connections > 50 {
            score -= 10.0;
        }

        if self.avg_response_time_ms > 2_000.0 {
            score -= 30.0;
        } else if self.avg_response_time_ms > 1_000.0 {
            score -= 15.0;
        }

        score -= 50.0 * self.error_rate();

        if self.last_failure.is_some_and(|at| {
            now.signed_duration_since(at) < Duration::minutes(RECENT_FAILURE_WINDOW_MINUTES)
        }) {
            score -= 25.0;
        }

        score
    }
}
