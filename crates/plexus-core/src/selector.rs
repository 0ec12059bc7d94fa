//! Target selection strategies. Each selector picks one target from a
//! non-empty, already-health-filtered candidate list.

use rand::Rng;
use rand::rngs::StdRng;

use plexus_storage::RollingStats;

use crate::config::{AliasTarget, ProviderRecord, SelectorKind};
use crate::pricing::{PricingOracle, cost_per_1k_output};

#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub target: &'a AliasTarget,
    pub provider: &'a ProviderRecord,
}

pub struct SelectorContext<'a> {
    pub stats: &'a RollingStats,
    pub oracle: &'a dyn PricingOracle,
    pub rng: &'a mut StdRng,
}

/// Returns the index of the chosen candidate. Deterministic given a
/// fixed RNG state and fixed statistics.
pub fn select(kind: SelectorKind, candidates: &[Candidate<'_>], ctx: &mut SelectorContext<'_>) -> usize {
    debug_assert!(!candidates.is_empty());
    match kind {
        SelectorKind::Random => ctx.rng.random_range(0..candidates.len()),
        SelectorKind::InOrder => 0,
        SelectorKind::Cost => min_by_key(candidates, |candidate| {
            let entry = candidate.provider.models.get(&candidate.target.model_slug);
            entry
                .and_then(|entry| {
                    cost_per_1k_output(&entry.pricing, candidate.provider.discount, ctx.oracle)
                })
                .unwrap_or(f64::INFINITY)
        }),
        SelectorKind::Latency => prefer_unseen_then(candidates, ctx.stats, |snapshot| {
            snapshot.avg_duration_ms.unwrap_or(f64::INFINITY)
        }),
        SelectorKind::Usage => {
            // Least recently used: unseen targets first, then the target
            // whose latest success is oldest.
            if let Some(index) = first_unseen(candidates, ctx.stats) {
                return index;
            }
            min_by_key(candidates, |candidate| {
                ctx.stats
                    .target(&candidate.provider.id, &candidate.target.model_slug)
                    .and_then(|snapshot| snapshot.last_success_at)
                    .map(|at| at.unix_timestamp_nanos() as f64)
                    .unwrap_or(f64::NEG_INFINITY)
            })
        }
        SelectorKind::Performance => prefer_unseen_then(candidates, ctx.stats, |snapshot| {
            // Negated: highest throughput wins under the shared min fold.
            -snapshot.avg_tokens_per_second.unwrap_or(0.0)
        }),
    }
}

fn first_unseen(candidates: &[Candidate<'_>], stats: &RollingStats) -> Option<usize> {
    candidates.iter().position(|candidate| {
        stats
            .target(&candidate.provider.id, &candidate.target.model_slug)
            .is_none()
    })
}

fn prefer_unseen_then<F>(candidates: &[Candidate<'_>], stats: &RollingStats, score: F) -> usize
where
    F: Fn(&plexus_storage::TargetSnapshot) -> f64,
{
    if let Some(index) = first_unseen(candidates, stats) {
        return index;
    }
    min_by_key(candidates, |candidate| {
        stats
            .target(&candidate.provider.id, &candidate.target.model_slug)
            .map(|snapshot| score(&snapshot))
            .unwrap_or(f64::INFINITY)
    })
}

/// Stable minimum: the first candidate wins ties, preserving config
/// order.
fn min_by_key<F>(candidates: &[Candidate<'_>], key: F) -> usize
where
    F: Fn(&Candidate<'_>) -> f64,
{
    let mut best = 0;
    let mut best_key = key(&candidates[0]);
    for (index, candidate) in candidates.iter().enumerate().skip(1) {
        let candidate_key = key(candidate);
        if candidate_key < best_key {
            best = index;
            best_key = candidate_key;
        }
    }
    best
}
