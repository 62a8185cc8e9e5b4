//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use proxy_traffic_core::endpoint::{Endpoint, HealthCheckSettings};
use proxy_traffic_core::events::{EventSink, TrafficEvent};
use proxy_traffic_core::health::{HealthCheck, HealthCheckResult, HealthProbe, ProbeFailure};
use std::sync::Mutex;
use url::Url;

/// Endpoint in `group` with failure threshold `f` and recovery threshold `r`.
pub fn endpoint(id: &str, group: &str, f: u32, r: u32) -> Endpoint {
    let health_check = HealthCheckSettings {
        failure_threshold: f,
        recovery_threshold: r,
        check_interval_secs: 1,
        ..HealthCheckSettings::default()
    };
    Endpoint::new(id, Url::parse(&format!("http://{id}.test:8080")).unwrap())
        .with_group(group)
        .with_health_check(health_check)
}

/// Probe whose outcome per endpoint is set by the test. Endpoints pass
/// unless told otherwise.
#[derive(Default)]
pub struct ScriptedProbe {
    failing: DashMap<String, bool>,
    calls: DashMap<String, usize>,
}

impl ScriptedProbe {
    pub fn set_failing(&self, endpoint_id: &str, failing: bool) {
        self.failing.insert(endpoint_id.to_string(), failing);
    }

    pub fn calls(&self, endpoint_id: &str) -> usize {
        self.calls.get(endpoint_id).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, check: &mut HealthCheck) -> HealthCheckResult {
        *self.calls.entry(check.endpoint_id.clone()).or_insert(0) += 1;
        let failing = self
            .failing
            .get(&check.endpoint_id)
            .map(|f| *f)
            .unwrap_or(false);

        let result = if failing {
            HealthCheckResult::failed(
                check.endpoint_id.clone(),
                3.0,
                Some(503),
                ProbeFailure::UnexpectedStatus { status: 503 },
            )
        } else {
            HealthCheckResult::passed(check.endpoint_id.clone(), 3.0, 200)
        };
        check.record(&result);
        result
    }
}

/// Keeps every emitted event for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TrafficEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TrafficEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: TrafficEvent) {
        self.events.lock().unwrap().push(event);
    }
}
