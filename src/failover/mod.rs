// src/failover/mod.rs
mod chain;
mod manager;
mod state;

pub use chain::{FailoverChain, FailoverStrategy};
pub use manager::{
    EndpointHealthSummary, FailoverManager, FailoverStatistics, MonitorHandles, SweepSummary,
};
pub use state::{FailoverState, StatusTransition};

use crate::health::HealthStatus;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FailoverError {
    #[error("Unknown endpoint {0}")]
    UnknownEndpoint(String),

    #[error("Endpoint {0} is already registered")]
    DuplicateEndpoint(String),

    #[error("Invalid endpoint {id}: {reason}")]
    InvalidEndpoint { id: String, reason: String },

    #[error("No failover chain configured for {0}")]
    ChainNotFound(String),

    #[error("Invalid failover chain for {primary}: {reason}")]
    InvalidChain { primary: String, reason: String },

    #[error("Failover strategy {0} is not supported")]
    UnsupportedStrategy(FailoverStrategy),
}

/// Latest failover verdict for an endpoint, readable without locking its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: HealthStatus,
    pub changed_at: Option<DateTime<Utc>>,
}

/// Read side of the failover state consumed by request routing.
pub trait EndpointHealthView: Send + Sync {
    fn status_of(&self, endpoint_id: &str) -> Option<StatusSnapshot>;
}
