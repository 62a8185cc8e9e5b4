// src/health/mod.rs
mod checker;
mod status;

pub use checker::{HealthChecker, HealthProbe, DEFAULT_HISTORY_SIZE};
pub use status::{HealthCheck, HealthCheckResult, HealthStatus, ProbeFailure};
