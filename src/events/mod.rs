// src/events/mod.rs
//! Structured traffic events and the sinks that receive them.
//!
//! Emission is fire-and-forget: sinks must not block and must not fail the
//! caller. Where events end up (log pipeline, message bus) is up to the host.

use crate::health::HealthStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrafficEvent {
    StatusTransition {
        endpoint_id: String,
        previous: HealthStatus,
        current: HealthStatus,
        consecutive_failures: u32,
        manual: bool,
        at: DateTime<Utc>,
    },
    Failover {
        primary_id: String,
        from_endpoint: String,
        to_endpoint: String,
        reason: String,
        at: DateTime<Utc>,
    },
    NoHealthyFallback {
        primary_id: String,
        failed_endpoint: String,
        at: DateTime<Utc>,
    },
    Failback {
        primary_id: String,
        to_endpoint: String,
        at: DateTime<Utc>,
    },
    EndpointDeactivated {
        endpoint_id: String,
        health_score: f64,
        at: DateTime<Utc>,
    },
    CacheHit {
        endpoint_id: String,
        key: String,
    },
    CacheMiss {
        endpoint_id: String,
        key: String,
    },
    CacheSet {
        endpoint_id: String,
        key: String,
        original_size: usize,
        stored_size: usize,
        compressed: bool,
    },
    CacheInvalidated {
        endpoint_id: String,
        invalidation_type: String,
        pattern: String,
        affected: usize,
        triggered_by: String,
    },
}

impl TrafficEvent {
    pub fn severity(&self) -> Severity {
        match self {
            TrafficEvent::StatusTransition {
                previous, current, ..
            } => match (previous.severity(), current.severity()) {
                (Some(before), Some(after)) if after < before => Severity::Info,
                (None, Some(0)) => Severity::Info,
                _ => Severity::Warning,
            },
            TrafficEvent::Failover { .. } | TrafficEvent::EndpointDeactivated { .. } => {
                Severity::Warning
            }
            TrafficEvent::NoHealthyFallback { .. } => Severity::Critical,
            _ => Severity::Info,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrafficEvent::StatusTransition { .. } => "status_transition",
            TrafficEvent::Failover { .. } => "failover",
            TrafficEvent::NoHealthyFallback { .. } => "no_healthy_fallback",
            TrafficEvent::Failback { .. } => "failback",
            TrafficEvent::EndpointDeactivated { .. } => "endpoint_deactivated",
            TrafficEvent::CacheHit { .. } => "cache_hit",
            TrafficEvent::CacheMiss { .. } => "cache_miss",
            TrafficEvent::CacheSet { .. } => "cache_set",
            TrafficEvent::CacheInvalidated { .. } => "cache_invalidated",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TrafficEvent);
}

/// Default sink: writes every event to the `tracing` pipeline.
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: TrafficEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match event.severity() {
            Severity::Info => info!(kind = event.name(), %payload, "traffic event"),
            Severity::Warning => warn!(kind = event.name(), %payload, "traffic event"),
            Severity::Critical => error!(kind = event.name(), %payload, "traffic event"),
        }
    }
}

/// Publishes events to any number of subscribers. Lagging or absent
/// subscribers never hold up the emitter.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<TrafficEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrafficEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: TrafficEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(previous: HealthStatus, current: HealthStatus) -> TrafficEvent {
        TrafficEvent::StatusTransition {
            endpoint_id: "a".into(),
            previous,
            current,
            consecutive_failures: 0,
            manual: false,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_transition_severity() {
        use HealthStatus::*;
        assert_eq!(transition(Healthy, Degraded).severity(), Severity::Warning);
        assert_eq!(transition(Degraded, Offline).severity(), Severity::Warning);
        assert_eq!(transition(Unhealthy, Degraded).severity(), Severity::Info);
        assert_eq!(transition(Unknown, Healthy).severity(), Severity::Info);
        assert_eq!(transition(Unknown, Degraded).severity(), Severity::Warning);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();

        sink.emit(transition(HealthStatus::Healthy, HealthStatus::Degraded));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "status_transition");
    }

    #[test]
    fn test_serializes_with_event_tag() {
        let json = serde_json::to_value(transition(HealthStatus::Healthy, HealthStatus::Offline))
            .unwrap();
        assert_eq!(json["event"], "status_transition");
        assert_eq!(json["current"], "OFFLINE");
    }
}
