// src/load_balancer/health_based.rs
use super::{Candidate, SelectionContext, SelectionStrategy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

const MAX_WEIGHT_BONUS: f64 = 20.0;

/// Routing preference for one candidate. Higher is better; not clamped.
pub fn selection_score(candidate: &Candidate, now: DateTime<Utc>) -> f64 {
    let mut score = candidate.load.penalty_score(now);

    if candidate.weight() > 1 {
        score += (5.0 * f64::from(candidate.weight() - 1)).min(MAX_WEIGHT_BONUS);
    }

    score
}

#[derive(Debug, Default)]
pub struct HealthBasedStrategy;

#[async_trait]
impl SelectionStrategy for HealthBasedStrategy {
    async fn select(&self, candidates: &[Candidate], ctx: &SelectionContext<'_>) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let score = selection_score(candidate, ctx.now);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((index, score));
            }
        }
        best.map(|(index, _)| index)
    }

    fn name(&self) -> &'static str {
        "health_based"
    }
}
