//! Selection policy — picks the next key for a request.
//!
//! Selection is a pure function of the pool snapshot, the request's
//! excluded set and the strategy. Nothing here reads the clock or
//! ambient randomness.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::PoolError;
use crate::key::Key;
use crate::store::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Oldest last success first; ties by lowest quota used, then by id.
    LeastRecentlyUsed,
    /// Stay on the first key (by id) until its usage reaches the threshold.
    Sticky { usage_threshold: u64 },
    /// Uniform choice, reproducible from the seed and the inputs.
    Random { seed: u64 },
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::LeastRecentlyUsed
    }
}

impl SelectionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SelectionStrategy::LeastRecentlyUsed => "least_recently_used",
            SelectionStrategy::Sticky { .. } => "sticky",
            SelectionStrategy::Random { .. } => "random",
        }
    }

    /// Pick an Active key not in `excluded`.
    pub fn select(&self, pool: &Pool, excluded: &BTreeSet<String>) -> Result<String, PoolError> {
        // Pool keys are ordered by id, so `eligible` is too.
        let eligible: Vec<&Key> = pool
            .active()
            .filter(|k| !excluded.contains(&k.id))
            .collect();
        if eligible.is_empty() {
            return Err(PoolError::NoEligibleKey);
        }

        let chosen = match *self {
            SelectionStrategy::LeastRecentlyUsed => least_recently_used(&eligible),
            SelectionStrategy::Sticky { usage_threshold } => eligible
                .iter()
                .copied()
                .find(|k| k.quota_used < usage_threshold)
                .unwrap_or_else(|| least_recently_used(&eligible)),
            SelectionStrategy::Random { seed } => {
                let drift: u64 = pool.keys().iter().map(|k| k.quota_used).fold(0, u64::wrapping_add);
                let mut rng = StdRng::seed_from_u64(
                    seed ^ drift.rotate_left(17) ^ (excluded.len() as u64),
                );
                eligible[rng.gen_range(0..eligible.len())]
            }
        };
        Ok(chosen.id.clone())
    }
}

fn least_recently_used<'a>(eligible: &[&'a Key]) -> &'a Key {
    // `eligible` is never empty here.
    let mut best = eligible[0];
    for &key in &eligible[1..] {
        let candidate = (key.last_success_at, key.quota_used, &key.id);
        if candidate < (best.last_success_at, best.quota_used, &best.id) {
            best = key;
        }
    }
    best
}
