// src/load_balancer/ip_hash.rs
use super::{Candidate, RoundRobinStrategy, SelectionContext, SelectionStrategy};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

fn ring_hash(key: &str) -> u128 {
    u128::from_be_bytes(md5::compute(key.as_bytes()).0)
}

/// Consistent-hash ring with `weight` virtual nodes per endpoint.
#[derive(Debug)]
struct HashRing {
    members: Vec<(String, u32)>,
    points: BTreeMap<u128, String>,
}

impl HashRing {
    fn build(members: Vec<(String, u32)>) -> Self {
        let uniform = members.iter().all(|(_, weight)| *weight == 0);
        let mut points = BTreeMap::new();
        for (id, weight) in &members {
            let nodes = if uniform { 1 } else { *weight };
            for vnode in 0..nodes {
                points.insert(ring_hash(&format!("{id}:{vnode}")), id.clone());
            }
        }
        Self { members, points }
    }

    /// First point at or after `hash`, wrapping to the smallest.
    fn locate(&self, hash: u128) -> Option<&str> {
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, id)| id.as_str())
    }
}

/// Client-IP affinity over a per-group ring. The ring is built on first use
/// and rebuilt when the group's active ids or weights change. Requests
/// without a client address fall back to round robin.
#[derive(Default)]
pub struct IpHashStrategy {
    rings: RwLock<HashMap<String, Arc<HashRing>>>,
    fallback: RoundRobinStrategy,
}

impl IpHashStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ring_for(&self, group: &str, members: Vec<(String, u32)>) -> Arc<HashRing> {
        {
            let rings = self.rings.read().await;
            if let Some(ring) = rings.get(group).filter(|ring| ring.members == members) {
                return ring.clone();
            }
        }

        let mut rings = self.rings.write().await;
        // another request may have rebuilt it while we waited for the lock
        if let Some(ring) = rings.get(group).filter(|ring| ring.members == members) {
            return ring.clone();
        }

        let ring = Arc::new(HashRing::build(members));
        debug!(group = %group, points = ring.points.len(), "Rebuilt consistent hash ring");
        rings.insert(group.to_string(), ring.clone());
        ring
    }
}

#[async_trait]
impl SelectionStrategy for IpHashStrategy {
    async fn select(&self, candidates: &[Candidate], ctx: &SelectionContext<'_>) -> Option<usize> {
        let Some(client_ip) = ctx.client_ip else {
            return self.fallback.select(candidates, ctx).await;
        };

        let members = candidates
            .iter()
            .map(|c| (c.id().to_string(), c.weight()))
            .collect();
        let ring = self.ring_for(ctx.group, members).await;

        let owner = ring.locate(ring_hash(&client_ip.to_string()))?;
        candidates.iter().position(|c| c.id() == owner)
    }

    async fn reset(&self) {
        self.rings.write().await.clear();
        self.fallback.reset().await;
    }

    fn name(&self) -> &'static str {
        "ip_hash"
    }
}
