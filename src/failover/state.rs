// src/failover/state.rs
use crate::endpoint::Endpoint;
use crate::health::{HealthCheck, HealthStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub at: DateTime<Utc>,
    pub manual: bool,
}

impl StatusTransition {
    pub fn is_recovery(&self) -> bool {
        matches!(
            (self.previous.severity(), self.current.severity()),
            (Some(before), Some(after)) if after < before
        )
    }
}

/// Health state machine for one endpoint.
///
/// Failing streaks push the status to at least `Degraded` at F failures,
/// `Unhealthy` at 2F and `Offline` at 3F, jumping levels when the streak is
/// already past a boundary. Failures never improve the status. Once a passing
/// streak reaches R, every further pass steps one level toward `Healthy`.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverState {
    pub endpoint_id: String,
    pub current_status: HealthStatus,
    pub previous_status: HealthStatus,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub failover_count: u64,
    pub last_failover_at: Option<DateTime<Utc>>,
    pub recovery_count: u64,
    pub last_recovery_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub health_check: HealthCheck,
}

impl FailoverState {
    pub fn new(endpoint: &Endpoint) -> Result<Self, url::ParseError> {
        Ok(Self {
            endpoint_id: endpoint.id.clone(),
            current_status: HealthStatus::Unknown,
            previous_status: HealthStatus::Unknown,
            status_changed_at: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            failover_count: 0,
            last_failover_at: None,
            recovery_count: 0,
            last_recovery_at: None,
            failure_threshold: endpoint.health_check.failure_threshold.max(1),
            recovery_threshold: endpoint.health_check.recovery_threshold.max(1),
            health_check: HealthCheck::for_endpoint(endpoint)?,
        })
    }

    /// The status implied by the current failing streak alone.
    pub fn failure_level(&self) -> HealthStatus {
        let f = self.failure_threshold;
        match self.consecutive_failures {
            n if n >= f.saturating_mul(3) => HealthStatus::Offline,
            n if n >= f.saturating_mul(2) => HealthStatus::Unhealthy,
            n if n >= f => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }

    pub fn record_outcome(&mut self, success: bool, now: DateTime<Utc>) -> Option<StatusTransition> {
        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.settle(success, now, false)
    }

    /// Operator escape hatch: pushes the failing streak to the `Unhealthy`
    /// boundary and runs the normal evaluation.
    pub fn force_failure(&mut self, now: DateTime<Utc>) -> Option<StatusTransition> {
        self.consecutive_successes = 0;
        self.consecutive_failures = self
            .consecutive_failures
            .max(self.failure_threshold.saturating_mul(2));
        self.settle(false, now, true)
    }

    pub fn availability(&self) -> Option<f64> {
        self.health_check.availability()
    }

    fn settle(&mut self, success: bool, now: DateTime<Utc>, manual: bool) -> Option<StatusTransition> {
        let current = self.current_status;
        let next = if success {
            match current {
                HealthStatus::Unknown | HealthStatus::Healthy => HealthStatus::Healthy,
                status if self.consecutive_successes >= self.recovery_threshold => {
                    status.recovered()
                }
                status => status,
            }
        } else {
            let floor = match current {
                HealthStatus::Unknown => HealthStatus::Degraded,
                status => status,
            };
            worse(floor, self.failure_level())
        };

        if next == current {
            return None;
        }

        self.previous_status = current;
        self.current_status = next;
        self.status_changed_at = Some(now);

        if next.is_failed() && !current.is_failed() {
            self.failover_count += 1;
            self.last_failover_at = Some(now);
        }
        if next == HealthStatus::Healthy && current != HealthStatus::Unknown {
            self.recovery_count += 1;
            self.last_recovery_at = Some(now);
        }

        Some(StatusTransition {
            previous: current,
            current: next,
            at: now,
            manual,
        })
    }
}

fn worse(a: HealthStatus, b: HealthStatus) -> HealthStatus {
    if b.severity() > a.severity() {
        b
    } else {
        a
    }
}
