//! Weighted random selection primitives.
//!
//! Candidate ordering uses weighted reservoir sampling (Efraimidis-Spirakis):
//! every item draws `u^(1/w)` with `u` uniform in (0, 1] and items are sorted
//! by that key, descending. The first item is then picked with probability
//! proportional to its weight, and later positions follow the same law over
//! the remaining items. Keys are kept in log space (`ln(u) / w`) so tiny
//! weights do not underflow to zero.

use std::cmp::Ordering;

use rand::{Rng, RngExt};

use crate::storage::CandidateQueue;

/// Log-space sort key of one item for weighted ordering.
///
/// Non-positive or non-finite weights sort last.
pub fn reservoir_key<R: Rng + ?Sized>(weight: f64, rng: &mut R) -> f64 {
    if !(weight.is_finite() && weight > 0.0) {
        return f64::NEG_INFINITY;
    }
    // Uniform in (0, 1]; zero would erase the weight.
    let u: f64 = 1.0 - rng.random::<f64>();
    u.ln() / weight
}

/// Orders candidates by CPU time bucket descending, then by a
/// priority-weighted random draw, and keeps the first `limit`.
pub fn rank_candidates<R: Rng + ?Sized>(
    candidates: Vec<CandidateQueue>,
    limit: usize,
    rng: &mut R,
) -> Vec<CandidateQueue> {
    let mut keyed: Vec<(f64, CandidateQueue)> = candidates
        .into_iter()
        .map(|candidate| (reservoir_key(candidate.priority, rng), candidate))
        .collect();

    keyed.sort_by(|(key_a, a), (key_b, b)| {
        b.cpu_time
            .cmp(&a.cpu_time)
            .then_with(|| key_b.partial_cmp(key_a).unwrap_or(Ordering::Equal))
    });

    keyed
        .into_iter()
        .take(limit)
        .map(|(_, candidate)| candidate)
        .collect()
}

/// Picks an index with probability proportional to its weight.
///
/// Returns `None` when no weight is positive.
pub fn pick_weighted<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    let positive = |w: &f64| w.is_finite() && *w > 0.0;
    let total: f64 = weights.iter().copied().filter(positive).sum();
    if total <= 0.0 {
        return None;
    }

    let roll: f64 = rng.random_range(0.0..total);
    let mut cumulative = 0.0;
    let mut last = None;
    for (idx, weight) in weights.iter().enumerate() {
        if !positive(weight) {
            continue;
        }
        cumulative += weight;
        last = Some(idx);
        if roll < cumulative {
            return Some(idx);
        }
    }

    // Rounding can leave the roll just past the final sum.
    last
}
