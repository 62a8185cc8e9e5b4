// src/load_balancer/balancer.rs
use super::{
    create_strategy, BalancerError, Candidate, LoadBalancingAlgorithm, SelectionContext,
    SelectionStrategy,
};
use crate::endpoint::{Endpoint, EndpointLoad};
use crate::events::{EventSink, TrafficEvent};
use crate::failover::EndpointHealthView;
use crate::health::HealthStatus;
use crate::metrics::MetricsCollector;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hyper::Method;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct EndpointSlot {
    endpoint: ArcSwap<Endpoint>,
    load: RwLock<EndpointLoad>,
}

#[derive(Debug, Clone)]
pub struct SelectedEndpoint {
    pub endpoint: Arc<Endpoint>,
    pub algorithm: LoadBalancingAlgorithm,
    pub health_score: f64,
    pub current_connections: u64,
}

impl SelectedEndpoint {
    pub fn id(&self) -> &str {
        &self.endpoint.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStatistics {
    pub endpoints: usize,
    pub active: usize,
    pub current_connections: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadBalancerStatistics {
    pub algorithm: LoadBalancingAlgorithm,
    pub total_endpoints: usize,
    pub active_endpoints: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub selections: u64,
    pub unavailable_selections: u64,
    pub groups: BTreeMap<String, GroupStatistics>,
    pub endpoints: Vec<EndpointLoad>,
}

/// Picks one endpoint per request from a group.
///
/// An endpoint is a candidate when its local load record is active and the
/// failover view (if attached) does not report it `Unhealthy` or `Offline`.
/// Candidates are ordered by descending priority, then id, so ties in every
/// algorithm resolve the same way.
pub struct LoadBalancer {
    endpoints: DashMap<String, Arc<EndpointSlot>>,
    algorithm: ArcSwap<LoadBalancingAlgorithm>,
    strategies: HashMap<LoadBalancingAlgorithm, Arc<dyn SelectionStrategy>>,
    health_view: Option<Arc<dyn EndpointHealthView>>,
    events: Arc<dyn EventSink>,
    metrics: Option<Arc<MetricsCollector>>,
    selections: AtomicU64,
    unavailable: AtomicU64,
}

impl LoadBalancer {
    pub fn new(
        algorithm: LoadBalancingAlgorithm,
        events: Arc<dyn EventSink>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let strategies = LoadBalancingAlgorithm::ALL
            .into_iter()
            .map(|algorithm| (algorithm, create_strategy(algorithm)))
            .collect();

        Self {
            endpoints: DashMap::new(),
            algorithm: ArcSwap::from_pointee(algorithm),
            strategies,
            health_view: None,
            events,
            metrics,
            selections: AtomicU64::new(0),
            unavailable: AtomicU64::new(0),
        }
    }

    /// Excludes endpoints the failover side has marked failed.
    pub fn with_health_view(mut self, view: Arc<dyn EndpointHealthView>) -> Self {
        self.health_view = Some(view);
        self
    }

    pub fn algorithm(&self) -> LoadBalancingAlgorithm {
        **self.algorithm.load()
    }

    pub fn add_endpoint(&self, endpoint: Endpoint) -> Result<(), BalancerError> {
        endpoint.validate().map_err(|e| BalancerError::InvalidEndpoint {
            id: endpoint.id.clone(),
            reason: e.to_string(),
        })?;

        let id = endpoint.id.clone();
        match self.endpoints.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BalancerError::DuplicateEndpoint(id)),
            Entry::Vacant(slot) => {
                debug!(endpoint = %id, group = %endpoint.group, weight = endpoint.weight, "Added endpoint to load balancer");
                slot.insert(Arc::new(EndpointSlot {
                    load: RwLock::new(EndpointLoad::new(id.as_str())),
                    endpoint: ArcSwap::from_pointee(endpoint),
                }));
            }
        }
        Ok(())
    }

    pub fn remove_endpoint(&self, endpoint_id: &str) -> bool {
        let removed = self.endpoints.remove(endpoint_id).is_some();
        if removed {
            debug!(endpoint = %endpoint_id, "Removed endpoint from load balancer");
        }
        removed
    }

    pub fn update_endpoint_weight(&self, endpoint_id: &str, weight: u32) -> Result<(), BalancerError> {
        self.update_endpoint(endpoint_id, |endpoint| endpoint.weight = weight)?;
        info!(endpoint = %endpoint_id, weight, "Updated endpoint weight");
        Ok(())
    }

    pub fn update_endpoint_priority(&self, endpoint_id: &str, priority: i32) -> Result<(), BalancerError> {
        self.update_endpoint(endpoint_id, |endpoint| endpoint.priority = priority)?;
        info!(endpoint = %endpoint_id, priority, "Updated endpoint priority");
        Ok(())
    }

    pub fn endpoint(&self, endpoint_id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .get(endpoint_id)
            .map(|slot| slot.endpoint.load_full())
    }

    pub async fn endpoint_load(&self, endpoint_id: &str) -> Option<EndpointLoad> {
        let slot = self.slot(endpoint_id).ok()?;
        let load = slot.load.read().await;
        Some(load.clone())
    }

    /// `None` means the group has no routable endpoint; callers answer 503.
    pub async fn select(
        &self,
        group: &str,
        client_ip: Option<IpAddr>,
        method: &Method,
        path: &str,
    ) -> Option<SelectedEndpoint> {
        let algorithm = self.algorithm();
        let now = Utc::now();
        let candidates = self.candidates(group, now).await;

        let picked = if candidates.is_empty() {
            None
        } else {
            let ctx = SelectionContext {
                group,
                client_ip,
                now,
            };
            match self.strategies.get(&algorithm) {
                Some(strategy) => strategy
                    .select(&candidates, &ctx)
                    .await
                    .and_then(|index| candidates.get(index)),
                None => None,
            }
        };

        let Some(candidate) = picked else {
            self.unavailable.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_selection(group, algorithm.as_str(), None);
            }
            warn!(group = %group, %method, path = %path, "No active endpoint available");
            return None;
        };

        self.selections.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_selection(group, algorithm.as_str(), Some(candidate.id()));
        }
        if let Ok(slot) = self.slot(candidate.id()) {
            slot.load.write().await.last_access = Some(now);
        }

        debug!(
            group = %group,
            endpoint = %candidate.id(),
            %algorithm,
            %method,
            path = %path,
            "Selected endpoint"
        );

        Some(SelectedEndpoint {
            endpoint: candidate.endpoint.clone(),
            algorithm,
            health_score: candidate.load.health_score,
            current_connections: candidate.load.current_connections,
        })
    }

    /// Records one completed upstream request.
    pub async fn update_endpoint_load(
        &self,
        endpoint_id: &str,
        connections_delta: i64,
        response_time_ms: f64,
        success: bool,
    ) -> Result<(), BalancerError> {
        let slot = self.slot(endpoint_id)?;
        let now = Utc::now();

        let (deactivated, snapshot) = {
            let mut load = slot.load.write().await;
            load.apply_connections_delta(connections_delta);
            let deactivated = load.record_completion(response_time_ms, success, now);
            (deactivated, load.clone())
        };

        if let Some(metrics) = &self.metrics {
            metrics.update_endpoint_load(endpoint_id, snapshot.current_connections, snapshot.active);
        }
        if deactivated {
            warn!(
                endpoint = %endpoint_id,
                health_score = snapshot.health_score,
                error_rate = snapshot.error_rate(),
                "Endpoint deactivated by load balancer"
            );
            self.events.emit(TrafficEvent::EndpointDeactivated {
                endpoint_id: endpoint_id.to_string(),
                health_score: snapshot.health_score,
                at: now,
            });
        }
        Ok(())
    }

    /// Adjusts the open-connection count without completing a request,
    /// e.g. `+1` right after dispatch. Returns the new count.
    pub async fn track_connection(&self, endpoint_id: &str, delta: i64) -> Result<u64, BalancerError> {
        let slot = self.slot(endpoint_id)?;
        let mut load = slot.load.write().await;
        load.apply_connections_delta(delta);
        if let Some(metrics) = &self.metrics {
            metrics.update_endpoint_load(endpoint_id, load.current_connections, load.active);
        }
        Ok(load.current_connections)
    }

    /// Returns `true` if the endpoint was inactive.
    pub async fn reactivate_endpoint(&self, endpoint_id: &str) -> Result<bool, BalancerError> {
        let slot = self.slot(endpoint_id)?;
        let mut load = slot.load.write().await;
        if load.active {
            return Ok(false);
        }
        load.reactivate();
        info!(endpoint = %endpoint_id, "Endpoint reactivated");
        Ok(true)
    }

    /// Switches algorithm and clears every strategy's local state.
    /// Endpoint load is kept.
    pub async fn set_algorithm(&self, algorithm: LoadBalancingAlgorithm) {
        let previous = self.algorithm.swap(Arc::new(algorithm));
        for strategy in self.strategies.values() {
            strategy.reset().await;
        }
        info!(from = %previous, to = %algorithm, "Load balancing algorithm changed");
    }

    pub async fn set_algorithm_by_name(&self, name: &str) -> Result<(), BalancerError> {
        let algorithm = name.parse()?;
        self.set_algorithm(algorithm).await;
        Ok(())
    }

    pub async fn get_statistics(&self) -> LoadBalancerStatistics {
        let mut slots: Vec<Arc<EndpointSlot>> =
            self.endpoints.iter().map(|slot| slot.value().clone()).collect();
        slots.sort_by(|a, b| a.endpoint.load().id.cmp(&b.endpoint.load().id));

        let mut groups: BTreeMap<String, GroupStatistics> = BTreeMap::new();
        let mut endpoints = Vec::with_capacity(slots.len());
        for slot in slots {
            let load = slot.load.read().await.clone();
            let group = groups.entry(slot.endpoint.load().group.clone()).or_default();
            group.endpoints += 1;
            group.current_connections += load.current_connections;
            if load.active {
                group.active += 1;
            }
            endpoints.push(load);
        }

        LoadBalancerStatistics {
            algorithm: self.algorithm(),
            total_endpoints: endpoints.len(),
            active_endpoints: endpoints.iter().filter(|l| l.active).count(),
            total_requests: endpoints.iter().map(|l| l.total_requests).sum(),
            failed_requests: endpoints.iter().map(|l| l.failed_requests).sum(),
            selections: self.selections.load(Ordering::Relaxed),
            unavailable_selections: self.unavailable.load(Ordering::Relaxed),
            groups,
            endpoints,
        }
    }

    fn slot(&self, endpoint_id: &str) -> Result<Arc<EndpointSlot>, BalancerError> {
        self.endpoints
            .get(endpoint_id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| BalancerError::UnknownEndpoint(endpoint_id.to_string()))
    }

    fn update_endpoint<F>(&self, endpoint_id: &str, change: F) -> Result<(), BalancerError>
    where
        F: Fn(&mut Endpoint),
    {
        let slot = self.slot(endpoint_id)?;
        slot.endpoint.rcu(|current| {
            let mut updated = Endpoint::clone(current);
            change(&mut updated);
            updated
        });
        Ok(())
    }

    fn status_of(&self, endpoint_id: &str) -> Option<(HealthStatus, Option<DateTime<Utc>>)> {
        self.health_view
            .as_ref()?
            .status_of(endpoint_id)
            .map(|snapshot| (snapshot.status, snapshot.changed_at))
    }

    async fn candidates(&self, group: &str, now: DateTime<Utc>) -> Vec<Candidate> {
        let slots: Vec<Arc<EndpointSlot>> = self
            .endpoints
            .iter()
            .filter(|slot| slot.endpoint.load().group == group)
            .map(|slot| slot.value().clone())
            .collect();

        let mut candidates = Vec::with_capacity(slots.len());
        for slot in slots {
            let endpoint = slot.endpoint.load_full();
            let status = self.status_of(&endpoint.id);
            if status.is_some_and(|(status, _)| status.is_failed()) {
                continue;
            }

            let mut load = slot.load.read().await.clone();
            if !load.active {
                let recovered = matches!(
                    (status, load.deactivated_at),
                    (Some((HealthStatus::Healthy, Some(changed_at))), Some(deactivated_at))
                        if changed_at >= deactivated_at
                );
                let sat_out = load.deactivation_expired(now);
                if !recovered && !sat_out {
                    continue;
                }
                let mut guard = slot.load.write().await;
                if !guard.active {
                    guard.reactivate();
                    if recovered {
                        info!(endpoint = %endpoint.id, "Endpoint reactivated after failover recovery");
                    } else {
                        info!(endpoint = %endpoint.id, "Endpoint reactivated after sitting out its failure window");
                    }
                }
                load = guard.clone();
            }

            candidates.push(Candidate::new(endpoint, load));
        }

        candidates.sort_by(|a, b| {
            (Reverse(a.endpoint.priority), a.id()).cmp(&(Reverse(b.endpoint.priority), b.id()))
        });
        candidates
    }
}
