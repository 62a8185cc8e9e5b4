// src/failover/manager.rs
use super::chain::{FailoverChain, FailoverStrategy};
use super::state::{FailoverState, StatusTransition};
use super::{EndpointHealthView, FailoverError, StatusSnapshot};
use crate::config::FailoverConfig;
use crate::endpoint::Endpoint;
use crate::events::{EventSink, TrafficEvent};
use crate::health::{HealthCheckResult, HealthProbe, HealthStatus};
use crate::metrics::MetricsCollector;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Leeway when deciding whether an endpoint's own check interval has elapsed.
const SCHEDULE_SLACK: Duration = Duration::from_millis(500);

struct EndpointMonitor {
    endpoint: Endpoint,
    state: Mutex<FailoverState>,
}

/// Per-endpoint view published after every evaluation, so readers never wait
/// on a probe in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointHealthSummary {
    pub endpoint_id: String,
    pub status: HealthStatus,
    pub previous_status: HealthStatus,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub availability: Option<f64>,
    pub failover_count: u64,
    pub recovery_count: u64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&FailoverState> for EndpointHealthSummary {
    fn from(state: &FailoverState) -> Self {
        Self {
            endpoint_id: state.endpoint_id.clone(),
            status: state.current_status,
            previous_status: state.previous_status,
            status_changed_at: state.status_changed_at,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            total_checks: state.health_check.total_checks,
            successful_checks: state.health_check.successful_checks,
            availability: state.availability(),
            failover_count: state.failover_count,
            recovery_count: state.recovery_count,
            last_check_at: state.health_check.last_check_at,
            last_error: state.health_check.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverStatistics {
    pub total_endpoints: usize,
    pub status_counts: BTreeMap<HealthStatus, usize>,
    pub endpoints: Vec<EndpointHealthSummary>,
    pub chains: Vec<FailoverChain>,
    pub total_failovers: u64,
    pub successful_failovers: u64,
    pub sweeps_completed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub probed: usize,
    pub passed: usize,
    pub failed: usize,
    /// Targets left unprobed because shutdown was requested mid-sweep.
    pub skipped: usize,
}

pub struct MonitorHandles {
    health: JoinHandle<()>,
    recovery: JoinHandle<()>,
    statistics: JoinHandle<()>,
}

impl MonitorHandles {
    /// Waits for all loops to finish; call after [`FailoverManager::shutdown`].
    pub async fn join(self) {
        for (name, handle) in [
            ("health", self.health),
            ("recovery", self.recovery),
            ("statistics", self.statistics),
        ] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Failover loop ended abnormally");
            }
        }
    }
}

pub struct FailoverManager {
    config: FailoverConfig,
    probe: Arc<dyn HealthProbe>,
    events: Arc<dyn EventSink>,
    metrics: Option<Arc<MetricsCollector>>,
    monitors: DashMap<String, Arc<EndpointMonitor>>,
    summaries: DashMap<String, EndpointHealthSummary>,
    last_scheduled: DashMap<String, Instant>,
    chains: DashMap<String, FailoverChain>,
    semaphore: Arc<Semaphore>,
    sweeps: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FailoverManager {
    pub fn new(
        config: FailoverConfig,
        probe: Arc<dyn HealthProbe>,
        events: Arc<dyn EventSink>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_checks.max(1)));

        Self {
            config,
            probe,
            events,
            metrics,
            monitors: DashMap::new(),
            summaries: DashMap::new(),
            last_scheduled: DashMap::new(),
            chains: DashMap::new(),
            semaphore,
            sweeps: AtomicU64::new(0),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn add_endpoint(&self, endpoint: Endpoint) -> Result<(), FailoverError> {
        let invalid = |reason: String| FailoverError::InvalidEndpoint {
            id: endpoint.id.clone(),
            reason,
        };
        endpoint.validate().map_err(|e| invalid(e.to_string()))?;
        let state = FailoverState::new(&endpoint).map_err(|e| invalid(e.to_string()))?;
        let summary = EndpointHealthSummary::from(&state);
        let id = endpoint.id.clone();

        match self.monitors.entry(id.clone()) {
            Entry::Occupied(_) => return Err(FailoverError::DuplicateEndpoint(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(EndpointMonitor {
                    endpoint,
                    state: Mutex::new(state),
                }));
            }
        }
        self.summaries.insert(id.clone(), summary);

        info!(endpoint = %id, "Registered endpoint for health monitoring");
        Ok(())
    }

    pub fn remove_endpoint(&self, endpoint_id: &str) -> bool {
        if self.monitors.remove(endpoint_id).is_none() {
            return false;
        }
        self.summaries.remove(endpoint_id);
        self.last_scheduled.remove(endpoint_id);
        self.probe.forget(endpoint_id);

        if self.chains.remove(endpoint_id).is_some() {
            info!(primary = %endpoint_id, "Removed failover chain with its primary");
        }
        for mut chain in self.chains.iter_mut() {
            if chain.remove_fallback(endpoint_id) {
                warn!(
                    primary = %chain.primary_id,
                    fallback = %endpoint_id,
                    "Removed deregistered endpoint from failover chain"
                );
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.forget_endpoint(endpoint_id);
        }

        info!(endpoint = %endpoint_id, "Deregistered endpoint");
        true
    }

    pub fn set_failover_chain(
        &self,
        primary_id: &str,
        fallback_ids: Vec<String>,
        strategy: FailoverStrategy,
    ) -> Result<(), FailoverError> {
        if !strategy.is_supported() {
            return Err(FailoverError::UnsupportedStrategy(strategy));
        }
        if !self.monitors.contains_key(primary_id) {
            return Err(FailoverError::UnknownEndpoint(primary_id.to_string()));
        }
        let invalid = |reason: String| FailoverError::InvalidChain {
            primary: primary_id.to_string(),
            reason,
        };
        if fallback_ids.is_empty() {
            return Err(invalid("no fallbacks given".into()));
        }
        for (i, id) in fallback_ids.iter().enumerate() {
            if id == primary_id {
                return Err(invalid("primary listed as its own fallback".into()));
            }
            if fallback_ids[..i].contains(id) {
                return Err(invalid(format!("fallback {id} listed twice")));
            }
            if !self.monitors.contains_key(id) {
                return Err(FailoverError::UnknownEndpoint(id.clone()));
            }
        }

        info!(primary = %primary_id, fallbacks = ?fallback_ids, %strategy, "Configured failover chain");
        self.chains.insert(
            primary_id.to_string(),
            FailoverChain::new(primary_id, fallback_ids, strategy),
        );

        if self.status(primary_id).is_some_and(|s| s.is_failed()) {
            self.fail_over_from(primary_id, "primary already failed when chain was configured");
        }
        Ok(())
    }

    pub fn remove_failover_chain(&self, primary_id: &str) -> bool {
        self.chains.remove(primary_id).is_some()
    }

    pub fn get_failover_chain(&self, primary_id: &str) -> Option<FailoverChain> {
        self.chains.get(primary_id).map(|chain| chain.clone())
    }

    /// Where traffic for `primary_id` should go. `Ok(None)` means every member
    /// of the chain is down.
    pub fn effective_endpoint(&self, primary_id: &str) -> Result<Option<String>, FailoverError> {
        self.chains
            .get(primary_id)
            .map(|chain| chain.effective_endpoint().map(str::to_string))
            .ok_or_else(|| FailoverError::ChainNotFound(primary_id.to_string()))
    }

    pub fn status(&self, endpoint_id: &str) -> Option<HealthStatus> {
        self.summaries.get(endpoint_id).map(|s| s.status)
    }

    pub fn summary(&self, endpoint_id: &str) -> Option<EndpointHealthSummary> {
        self.summaries.get(endpoint_id).map(|s| s.clone())
    }

    /// Full state, waiting for any evaluation in progress on this endpoint.
    pub async fn state(&self, endpoint_id: &str) -> Option<FailoverState> {
        let monitor = self.monitors.get(endpoint_id).map(|m| m.value().clone())?;
        let state = monitor.state.lock().await;
        Some(state.clone())
    }

    pub fn health_history(&self, endpoint_id: &str) -> Vec<HealthCheckResult> {
        self.probe.history(endpoint_id)
    }

    /// Probes one endpoint now, outside the schedule.
    pub async fn force_health_check(
        &self,
        endpoint_id: &str,
    ) -> Result<HealthCheckResult, FailoverError> {
        let monitor = self.monitor(endpoint_id)?;
        info!(endpoint = %endpoint_id, "Forced health check");
        Ok(self.check_monitor(&monitor).await)
    }

    /// Marks an endpoint failed on operator request and fails its chains over.
    pub async fn trigger_manual_failover(
        &self,
        endpoint_id: &str,
        reason: &str,
    ) -> Result<HealthStatus, FailoverError> {
        let monitor = self.monitor(endpoint_id)?;
        let reason = format!("manual: {reason}");
        warn!(endpoint = %endpoint_id, %reason, "Manual failover triggered");

        let mut state = monitor.state.lock().await;
        match state.force_failure(Utc::now()) {
            Some(transition) => self.on_transition(&state, transition, &reason),
            None => {
                self.publish(&state);
                self.fail_over_from(endpoint_id, &reason);
            }
        }
        Ok(state.current_status)
    }

    /// One pass of the main health loop: probes every due endpoint that is
    /// not `Offline`.
    pub async fn run_health_sweep(self: Arc<Self>) -> SweepSummary {
        let now = Instant::now();
        let targets: Vec<Arc<EndpointMonitor>> = self
            .monitors
            .iter()
            .filter(|m| self.status(m.key()) != Some(HealthStatus::Offline))
            .filter(|m| self.is_due(&m.endpoint, now))
            .map(|m| m.value().clone())
            .collect();

        for monitor in &targets {
            self.last_scheduled.insert(monitor.endpoint.id.clone(), now);
        }

        self.sweep(targets, "health").await
    }

    /// One pass of the recovery loop: re-probes endpoints that are not
    /// healthy so recovery is noticed before the next main sweep.
    pub async fn run_recovery_sweep(self: Arc<Self>) -> SweepSummary {
        let probe_offline = self.config.probe_offline_in_recovery;
        let targets: Vec<Arc<EndpointMonitor>> = self
            .monitors
            .iter()
            .filter(|m| match self.status(m.key()) {
                Some(HealthStatus::Degraded) | Some(HealthStatus::Unhealthy) => true,
                Some(HealthStatus::Offline) => probe_offline,
                _ => false,
            })
            .map(|m| m.value().clone())
            .collect();

        self.sweep(targets, "recovery").await
    }

    /// Spawns the health, recovery and statistics loops.
    pub fn start(self: Arc<Self>) -> MonitorHandles {
        MonitorHandles {
            health: tokio::spawn(self.clone().health_loop()),
            recovery: tokio::spawn(self.clone().recovery_loop()),
            statistics: tokio::spawn(self.statistics_loop()),
        }
    }

    /// Stops launching probes; in-flight probes finish before the loops exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn get_statistics(&self) -> FailoverStatistics {
        let mut endpoints: Vec<EndpointHealthSummary> =
            self.summaries.iter().map(|s| s.value().clone()).collect();
        endpoints.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));

        let mut status_counts = BTreeMap::new();
        for summary in &endpoints {
            *status_counts.entry(summary.status).or_insert(0) += 1;
        }

        let mut chains: Vec<FailoverChain> = self.chains.iter().map(|c| c.value().clone()).collect();
        chains.sort_by(|a, b| a.primary_id.cmp(&b.primary_id));

        FailoverStatistics {
            total_endpoints: endpoints.len(),
            status_counts,
            total_failovers: chains.iter().map(|c| c.total_failovers).sum(),
            successful_failovers: chains.iter().map(|c| c.successful_failovers).sum(),
            chains,
            endpoints,
            sweeps_completed: self.sweeps.load(Ordering::Relaxed),
        }
    }

    fn monitor(&self, endpoint_id: &str) -> Result<Arc<EndpointMonitor>, FailoverError> {
        self.monitors
            .get(endpoint_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| FailoverError::UnknownEndpoint(endpoint_id.to_string()))
    }

    fn is_due(&self, endpoint: &Endpoint, now: Instant) -> bool {
        match self.last_scheduled.get(&endpoint.id) {
            None => true,
            Some(at) => {
                now.saturating_duration_since(*at) + SCHEDULE_SLACK
                    >= endpoint.health_check.check_interval()
            }
        }
    }

    fn is_healthy(&self, endpoint_id: &str) -> bool {
        self.status(endpoint_id) == Some(HealthStatus::Healthy)
    }

    async fn sweep(self: Arc<Self>, targets: Vec<Arc<EndpointMonitor>>, kind: &'static str) -> SweepSummary {
        let mut shutdown = self.shutdown_rx.clone();
        let mut handles = Vec::with_capacity(targets.len());
        let mut summary = SweepSummary::default();

        for (i, monitor) in targets.iter().enumerate() {
            if *shutdown.borrow() {
                summary.skipped = targets.len() - i;
                break;
            }
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        summary.skipped = targets.len() - i;
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    summary.skipped = targets.len() - i;
                    break;
                }
            };

            let manager = self.clone();
            let monitor = monitor.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                manager.check_monitor(&monitor).await
            }));
        }

        for joined in futures::future::join_all(handles).await {
            summary.probed += 1;
            match joined {
                Ok(result) if result.success => summary.passed += 1,
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    error!(sweep = kind, error = %e, "Health check task failed");
                    summary.failed += 1;
                }
            }
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        debug!(
            sweep = kind,
            probed = summary.probed,
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Sweep complete"
        );
        summary
    }

    /// Probes and evaluates one endpoint while holding its state lock, so
    /// evaluations of the same endpoint never interleave. The probe runs on a
    /// copy of the check record; state is only touched once it returns.
    async fn check_monitor(&self, monitor: &EndpointMonitor) -> HealthCheckResult {
        let mut state = monitor.state.lock().await;

        let mut check = state.health_check.clone();
        let result = self.probe.check(&mut check).await;

        state.health_check = check;
        match state.record_outcome(result.success, result.checked_at) {
            Some(transition) => {
                let reason = match &result.error {
                    Some(failure) => format!("health check failed: {failure}"),
                    None => "health check passed".to_string(),
                };
                self.on_transition(&state, transition, &reason);
            }
            None => self.publish(&state),
        }

        result
    }

    fn publish(&self, state: &FailoverState) {
        self.summaries
            .insert(state.endpoint_id.clone(), EndpointHealthSummary::from(state));
    }

    fn on_transition(&self, state: &FailoverState, transition: StatusTransition, reason: &str) {
        let endpoint_id = state.endpoint_id.as_str();
        self.publish(state);

        if let Some(metrics) = &self.metrics {
            metrics.record_status(endpoint_id, transition.current);
        }
        if transition.is_recovery() {
            info!(
                endpoint = %endpoint_id,
                previous = %transition.previous,
                current = %transition.current,
                "Endpoint health improved"
            );
        } else {
            warn!(
                endpoint = %endpoint_id,
                previous = %transition.previous,
                current = %transition.current,
                consecutive_failures = state.consecutive_failures,
                %reason,
                "Endpoint health changed"
            );
        }
        self.events.emit(TrafficEvent::StatusTransition {
            endpoint_id: endpoint_id.to_string(),
            previous: transition.previous,
            current: transition.current,
            consecutive_failures: state.consecutive_failures,
            manual: transition.manual,
            at: transition.at,
        });

        if transition.current.is_failed() {
            self.fail_over_from(endpoint_id, reason);
        } else if transition.current == HealthStatus::Healthy {
            self.fail_back_to(endpoint_id);
        }
    }

    /// Advances every chain currently routed to `failed_id`.
    fn fail_over_from(&self, failed_id: &str, reason: &str) {
        let now = Utc::now();
        let mut moves = Vec::new();
        for mut chain in self.chains.iter_mut() {
            if chain.effective_endpoint() != Some(failed_id) {
                continue;
            }
            let moved = chain.advance(|candidate| self.is_healthy(candidate), now);
            moves.push((chain.primary_id.clone(), moved));
        }

        for (primary_id, moved) in moves {
            if let Some(metrics) = &self.metrics {
                metrics.record_failover(&primary_id, moved.is_some());
            }
            match moved {
                Some(to_endpoint) => {
                    warn!(primary = %primary_id, from = %failed_id, to = %to_endpoint, "Failed over");
                    self.events.emit(TrafficEvent::Failover {
                        primary_id,
                        from_endpoint: failed_id.to_string(),
                        to_endpoint,
                        reason: reason.to_string(),
                        at: now,
                    });
                }
                None => {
                    error!(primary = %primary_id, failed = %failed_id, "No healthy fallback available");
                    self.events.emit(TrafficEvent::NoHealthyFallback {
                        primary_id,
                        failed_endpoint: failed_id.to_string(),
                        at: now,
                    });
                }
            }
        }
    }

    /// Points chains back at a recovered primary, or at any recovered member
    /// of a chain that had run out of fallbacks.
    fn fail_back_to(&self, recovered_id: &str) {
        let now = Utc::now();
        let mut restored = Vec::new();
        for mut chain in self.chains.iter_mut() {
            let target = if chain.primary_id == recovered_id {
                Some(0)
            } else if chain.exhausted {
                chain.position(recovered_id)
            } else {
                None
            };
            if let Some(index) = target {
                if chain.restore(index) {
                    restored.push(chain.primary_id.clone());
                }
            }
        }

        for primary_id in restored {
            info!(primary = %primary_id, to = %recovered_id, "Failover chain restored");
            self.events.emit(TrafficEvent::Failback {
                primary_id,
                to_endpoint: recovered_id.to_string(),
                at: now,
            });
        }
    }

    async fn health_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.health_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_rx.clone();

        info!(interval = ?self.config.health_check_interval(), "Starting health check loop");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.clone().run_health_sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health check loop stopped");
    }

    async fn recovery_loop(self: Arc<Self>) {
        let period = self.config.recovery_check_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_rx.clone();

        info!(interval = ?period, "Starting recovery check loop");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.clone().run_recovery_sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Recovery check loop stopped");
    }

    async fn statistics_loop(self: Arc<Self>) {
        let period = self.config.statistics_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.get_statistics();
                    let count = |status: HealthStatus| {
                        stats.status_counts.get(&status).copied().unwrap_or(0)
                    };
                    info!(
                        endpoints = stats.total_endpoints,
                        healthy = count(HealthStatus::Healthy),
                        degraded = count(HealthStatus::Degraded),
                        unhealthy = count(HealthStatus::Unhealthy),
                        offline = count(HealthStatus::Offline),
                        failovers = stats.total_failovers,
                        "Failover statistics"
                    );
                    if let Some(metrics) = &self.metrics {
                        for summary in &stats.endpoints {
                            metrics.set_health_status(&summary.endpoint_id, summary.status);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl EndpointHealthView for FailoverManager {
    fn status_of(&self, endpoint_id: &str) -> Option<StatusSnapshot> {
        self.summaries.get(endpoint_id).map(|s| StatusSnapshot {
            status: s.status,
            changed_at: s.status_changed_at,
        })
    }
}
