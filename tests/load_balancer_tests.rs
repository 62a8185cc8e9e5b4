// tests/load_balancer_tests.rs
mod common;

use common::{endpoint, RecordingSink};
use hyper::Method;
use proxy_traffic_core::endpoint::Endpoint;
use proxy_traffic_core::load_balancer::{BalancerError, LoadBalancer, LoadBalancingAlgorithm};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use url::Url;

fn balancer(algorithm: LoadBalancingAlgorithm, endpoints: &[(&str, u32)]) -> (LoadBalancer, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let lb = LoadBalancer::new(algorithm, sink.clone(), None);
    for (id, weight) in endpoints {
        lb.add_endpoint(endpoint(id, "web", 3, 2).with_weight(*weight))
            .unwrap();
    }
    (lb, sink)
}

async fn pick(lb: &LoadBalancer, client_ip: Option<IpAddr>) -> Option<String> {
    lb.select("web", client_ip, &Method::GET, "/")
        .await
        .map(|selected| selected.id().to_string())
}

async fn tally(lb: &LoadBalancer, picks: usize) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for _ in 0..picks {
        if let Some(id) = pick(lb, None).await {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    counts
}

fn ip(n: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + n))
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::RoundRobin, &[("a", 1), ("b", 1), ("c", 1)]);
    let counts = tally(&lb, 300).await;
    for id in ["a", "b", "c"] {
        assert_eq!(counts[id], 100);
    }
}

#[tokio::test]
async fn test_weighted_round_robin_follows_weights() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::WeightedRoundRobin, &[("a", 3), ("b", 1)]);
    let counts = tally(&lb, 4000).await;

    let share = counts["a"] as f64 / 4000.0;
    assert!((share - 0.75).abs() <= 0.05, "a got {share}");
    assert_eq!(counts["a"] + counts["b"], 4000);
}

#[tokio::test]
async fn test_least_connections_prefers_idle_endpoint() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::LeastConnections, &[("a", 1), ("b", 1)]);
    lb.track_connection("a", 3).await.unwrap();
    lb.track_connection("b", 1).await.unwrap();
    assert_eq!(pick(&lb, None).await.as_deref(), Some("b"));

    assert_eq!(lb.track_connection("b", 5).await.unwrap(), 6);
    assert_eq!(pick(&lb, None).await.as_deref(), Some("a"));

    // decrements saturate at zero
    assert_eq!(lb.track_connection("a", -10).await.unwrap(), 0);
    assert_eq!(
        lb.track_connection("zz", 1).await,
        Err(BalancerError::UnknownEndpoint("zz".into()))
    );
}

#[tokio::test]
async fn test_ip_hash_is_sticky_and_stable() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::IpHash, &[("a", 1), ("b", 1), ("c", 1)]);

    let first = pick(&lb, Some(ip(7))).await;
    for _ in 0..50 {
        assert_eq!(pick(&lb, Some(ip(7))).await, first);
    }

    let mut before = HashMap::new();
    for n in 0..200 {
        before.insert(n, pick(&lb, Some(ip(n))).await.unwrap());
    }

    // only clients that hashed to the removed endpoint move
    assert!(lb.remove_endpoint("c"));
    for (n, previous) in before {
        let now = pick(&lb, Some(ip(n))).await.unwrap();
        if previous != "c" {
            assert_eq!(now, previous, "client {n} moved");
        } else {
            assert_ne!(now, "c");
        }
    }
}

#[tokio::test]
async fn test_health_based_avoids_failing_endpoint() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::HealthBased, &[("a", 1), ("b", 1)]);
    for success in [true, true, true, false] {
        lb.update_endpoint_load("a", 0, 20.0, success).await.unwrap();
    }
    lb.update_endpoint_load("b", 0, 20.0, true).await.unwrap();

    for _ in 0..5 {
        assert_eq!(pick(&lb, None).await.as_deref(), Some("b"));
    }
}

#[tokio::test]
async fn test_priority_orders_ties() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::LeastConnections, &[("a", 1), ("b", 1)]);
    assert_eq!(pick(&lb, None).await.as_deref(), Some("a"));

    lb.update_endpoint_priority("b", 10).unwrap();
    assert_eq!(pick(&lb, None).await.as_deref(), Some("b"));
    assert_eq!(lb.endpoint("b").unwrap().priority, 10);
}

#[tokio::test]
async fn test_failing_endpoint_is_deactivated_and_reactivated() {
    let (lb, sink) = balancer(LoadBalancingAlgorithm::RoundRobin, &[("a", 1), ("b", 1)]);

    lb.update_endpoint_load("a", 0, 2_500.0, false).await.unwrap();
    let load = lb.endpoint_load("a").await.unwrap();
    assert!(!load.active);
    assert!(load.health_score < 20.0);
    assert!(sink.names().contains(&"endpoint_deactivated"));

    let counts = tally(&lb, 10).await;
    assert_eq!(counts.get("a"), None);

    assert!(lb.reactivate_endpoint("a").await.unwrap());
    assert!(!lb.reactivate_endpoint("a").await.unwrap());
    let load = lb.endpoint_load("a").await.unwrap();
    assert_eq!(load.health_score, 100.0);
    assert_eq!(load.total_requests, 0);

    let counts = tally(&lb, 10).await;
    assert_eq!(counts["a"], 5);
}

#[tokio::test]
async fn test_single_failures_keep_group_routable() {
    let (lb, sink) = balancer(LoadBalancingAlgorithm::RoundRobin, &[("a", 1), ("b", 1)]);
    lb.update_endpoint_load("a", 0, 10.0, false).await.unwrap();
    lb.update_endpoint_load("b", 0, 10.0, false).await.unwrap();

    for id in ["a", "b"] {
        let load = lb.endpoint_load(id).await.unwrap();
        assert!(load.active);
        assert_eq!(load.health_score, 25.0);
    }
    assert!(!sink.names().contains(&"endpoint_deactivated"));

    let counts = tally(&lb, 4).await;
    assert_eq!(counts["a"], 2);
    assert_eq!(counts["b"], 2);
}

#[tokio::test]
async fn test_empty_group_yields_none() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::Random, &[("a", 1)]);
    assert!(lb.select("missing", None, &Method::GET, "/").await.is_none());

    let stats = lb.get_statistics().await;
    assert_eq!(stats.unavailable_selections, 1);
    assert_eq!(stats.selections, 0);
}

#[tokio::test]
async fn test_algorithm_switch_by_name() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::RoundRobin, &[("a", 1), ("b", 1)]);

    lb.set_algorithm_by_name("weighted_least_connections").await.unwrap();
    assert_eq!(lb.algorithm(), LoadBalancingAlgorithm::WeightedLeastConnections);

    assert_eq!(
        lb.set_algorithm_by_name("fastest").await,
        Err(BalancerError::UnknownAlgorithm("fastest".into()))
    );
    assert_eq!(lb.algorithm(), LoadBalancingAlgorithm::WeightedLeastConnections);
}

#[tokio::test]
async fn test_endpoint_registration_errors() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::RoundRobin, &[("a", 1)]);

    assert_eq!(
        lb.add_endpoint(endpoint("a", "web", 3, 2)),
        Err(BalancerError::DuplicateEndpoint("a".into()))
    );
    assert_eq!(
        lb.update_endpoint_weight("zz", 2),
        Err(BalancerError::UnknownEndpoint("zz".into()))
    );
    assert!(!lb.remove_endpoint("zz"));
    assert!(matches!(
        lb.add_endpoint(Endpoint::new("a:v2", Url::parse("http://10.0.0.9:8080").unwrap())),
        Err(BalancerError::InvalidEndpoint { id, .. }) if id == "a:v2"
    ));
}

#[tokio::test]
async fn test_statistics_are_read_only() {
    let (lb, _) = balancer(LoadBalancingAlgorithm::RoundRobin, &[("a", 1), ("b", 2)]);
    lb.add_endpoint(endpoint("c", "api", 3, 2)).unwrap();
    tally(&lb, 4).await;
    lb.update_endpoint_load("a", 1, 40.0, true).await.unwrap();
    lb.update_endpoint_load("b", 0, 2_500.0, false).await.unwrap();

    let first = lb.get_statistics().await;
    let second = lb.get_statistics().await;
    assert_eq!(first, second);

    assert_eq!(first.total_endpoints, 3);
    assert_eq!(first.active_endpoints, 2);
    assert_eq!(first.total_requests, 2);
    assert_eq!(first.failed_requests, 1);
    assert_eq!(first.selections, 4);
    assert_eq!(first.groups["web"].endpoints, 2);
    assert_eq!(first.groups["web"].current_connections, 1);
    assert_eq!(first.groups["api"].active, 1);
    let ids: Vec<&str> = first.endpoints.iter().map(|l| l.endpoint_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}
