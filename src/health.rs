//! Health tracker — the only writer of a key's mutable state.
//!
//! Every attempt record is turned into exactly one store `apply`. The
//! transition table lives in [`HealthPolicy::transition`] and is a pure
//! function of the key, the outcome and the current time.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::PoolError;
use crate::key::{Key, KeyStatus};
use crate::outcome::{AttemptRecord, FatalReason, Outcome, RetryReason};
use crate::store::{CredentialStore, Pool};

// ── Policy ──────────────────────────────────────────────────────────

/// Tunable constants of the transition table. Deserialised from the
/// `health` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Consecutive transient failures before a key is cooled down.
    pub transient_failure_threshold: u32,
    pub rate_limit_backoff_base_secs: u64,
    pub rate_limit_backoff_cap_secs: u64,
    pub transient_cooldown_secs: u64,
    /// How long a key that reached its quota limit sits out.
    pub quota_cooldown_secs: u64,
    /// Quota charged for a success whose cost the upstream did not report.
    pub default_cost: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            transient_failure_threshold: 3,
            rate_limit_backoff_base_secs: 2,
            rate_limit_backoff_cap_secs: 3600,
            transient_cooldown_secs: 30,
            quota_cooldown_secs: 86_400,
            default_cost: 1,
        }
    }
}

fn secs(n: u64) -> Duration {
    Duration::seconds(n.min(i64::MAX as u64 / 1000) as i64)
}

impl HealthPolicy {
    /// Rate-limit cooldown after the `failures`-th consecutive failure:
    /// `base * 2^(failures - 1)`, capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63);
        let raw = self
            .rate_limit_backoff_base_secs
            .saturating_mul(1u64 << exponent);
        secs(raw.min(self.rate_limit_backoff_cap_secs))
    }

    /// Apply one outcome to `key`.
    pub fn transition(&self, key: &mut Key, outcome: &Outcome, now: DateTime<Utc>) {
        match *outcome {
            Outcome::Success { cost } => {
                key.consecutive_failures = 0;
                key.last_success_at = Some(now);
                if key.status != KeyStatus::Disabled {
                    key.status = KeyStatus::Active;
                }
                let charged = key.quota_used.saturating_add(cost.unwrap_or(self.default_cost));
                key.quota_used = match key.quota_limit {
                    Some(limit) => charged.min(limit),
                    None => charged,
                };
                if key.quota_reached() && key.status.is_active() {
                    key.status = KeyStatus::Cooling {
                        until: now + secs(self.quota_cooldown_secs),
                    };
                }
            }
            Outcome::RetryableFailure(reason) => {
                key.consecutive_failures = key.consecutive_failures.saturating_add(1);
                key.last_failure_at = Some(now);
                if key.status == KeyStatus::Disabled {
                    return;
                }
                let until = match reason {
                    RetryReason::RateLimited => Some(now + self.backoff(key.consecutive_failures)),
                    RetryReason::TransientUpstreamError
                        if key.consecutive_failures >= self.transient_failure_threshold =>
                    {
                        Some(now + secs(self.transient_cooldown_secs))
                    }
                    RetryReason::TransientUpstreamError => None,
                };
                if let Some(until) = until {
                    // Never shorten a cooldown that is already running.
                    let until = match key.status.cooldown_until() {
                        Some(existing) if existing > until => existing,
                        _ => until,
                    };
                    key.status = KeyStatus::Cooling { until };
                }
            }
            Outcome::FatalFailure(FatalReason::InvalidCredential)
            | Outcome::FatalFailure(FatalReason::QuotaExhaustedPermanently) => {
                key.consecutive_failures = key.consecutive_failures.saturating_add(1);
                key.last_failure_at = Some(now);
                key.status = KeyStatus::Disabled;
            }
        }
    }
}

// ── Tracker ─────────────────────────────────────────────────────────

pub struct HealthTracker {
    store: Arc<CredentialStore>,
    clock: Arc<dyn Clock>,
    policy: HealthPolicy,
}

impl HealthTracker {
    pub fn new(store: Arc<CredentialStore>, clock: Arc<dyn Clock>, policy: HealthPolicy) -> Self {
        Self { store, clock, policy }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Fold one attempt into its key's state. The record is persisted in
    /// the same write as the key.
    pub fn report(&self, record: &AttemptRecord) -> Result<Key, PoolError> {
        let now = self.clock.now();
        let mut before = None;
        let updated = self.store.apply(&record.key_id, Some(record), |key| {
            before = Some(key.status);
            self.policy.transition(key, &record.outcome, now);
        })?;

        tracing::debug!(
            key_id = %record.key_id,
            request_id = %record.request_id,
            outcome = record.outcome.kind(),
            reason = record.outcome.failure_reason().map(|r| r.code()).unwrap_or("-"),
            latency_ms = record.latency.as_millis() as u64,
            "Attempt recorded"
        );
        if let Some(before) = before {
            log_transition(&updated, before);
        }
        Ok(updated)
    }

    /// Snapshot the pool after promoting every expired cooldown to Active.
    ///
    /// A key whose promotion cannot be persisted stays Cooling.
    pub fn snapshot(&self) -> Pool {
        let now = self.clock.now();
        let pool = self.store.snapshot();
        let expired: Vec<String> = pool
            .keys()
            .iter()
            .filter(|k| matches!(k.status, KeyStatus::Cooling { until } if until <= now))
            .map(|k| k.id.clone())
            .collect();
        if expired.is_empty() {
            return pool;
        }

        for id in &expired {
            let swept = self.store.apply(id, None, |key| {
                // Re-check under the key's lock; a report may have won the race.
                if let KeyStatus::Cooling { until } = key.status {
                    if until <= now {
                        if key.quota_reached() {
                            key.quota_used = 0;
                        }
                        key.status = KeyStatus::Active;
                    }
                }
            });
            match swept {
                Ok(key) if key.status.is_active() => {
                    tracing::info!(key_id = %id, "Cooldown elapsed, key back in rotation");
                }
                Ok(_) | Err(PoolError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(key_id = %id, error = %e, "Could not persist cooldown expiry");
                }
            }
        }
        self.store.snapshot()
    }

    // ── Administrative transitions ──────────────────────────────────

    /// Force a key back to Active with a clean failure count.
    pub fn reset_key(&self, id: &str) -> Result<Key, PoolError> {
        let key = self.store.apply(id, None, |key| {
            key.status = KeyStatus::Active;
            key.consecutive_failures = 0;
        })?;
        tracing::info!(key_id = %id, "Key reset by administrator");
        Ok(key)
    }

    /// Zero the quota counter of every key. Keys sitting out because they
    /// reached their limit go straight back into rotation. Returns how many
    /// keys were reset.
    pub fn reset_usage(&self) -> Result<usize, PoolError> {
        self.reset_all("Usage counters reset", |key| {
            let capped = key.quota_reached();
            key.quota_used = 0;
            if capped && key.status.cooldown_until().is_some() {
                key.status = KeyStatus::Active;
            }
        })
    }

    /// Clear the failure count of every key and return failed keys to
    /// rotation. Keys cooling for quota stay out until their usage resets.
    pub fn reset_failures(&self) -> Result<usize, PoolError> {
        self.reset_all("Failure counters reset", |key| {
            key.consecutive_failures = 0;
            if !key.status.is_active() && !key.quota_reached() {
                key.status = KeyStatus::Active;
            }
        })
    }

    fn reset_all(&self, what: &str, reset: impl Fn(&mut Key)) -> Result<usize, PoolError> {
        let pool = self.store.snapshot();
        let mut count = 0;
        for key in pool.keys() {
            match self.store.apply(&key.id, None, &reset) {
                Ok(_) => count += 1,
                Err(PoolError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(keys = count, "{}", what);
        Ok(count)
    }

    /// Change a key's quota limit. A counter already past the new limit is
    /// clamped and the key cools down as if it had just reached it.
    pub fn set_quota_limit(&self, id: &str, limit: Option<u64>) -> Result<Key, PoolError> {
        let now = self.clock.now();
        let cooldown = secs(self.policy.quota_cooldown_secs);
        let key = self.store.apply(id, None, |key| {
            key.quota_limit = limit;
            if let Some(limit) = limit {
                key.quota_used = key.quota_used.min(limit);
            }
            if key.quota_reached() && key.status.is_active() {
                key.status = KeyStatus::Cooling { until: now + cooldown };
            }
        })?;
        tracing::info!(key_id = %id, quota_limit = ?limit, "Quota limit updated");
        Ok(key)
    }
}

fn log_transition(key: &Key, before: KeyStatus) {
    if before.label() == key.status.label() {
        return;
    }
    match key.status {
        KeyStatus::Disabled => tracing::warn!(
            key_id = %key.id,
            from = before.label(),
            failures = key.consecutive_failures,
            "Key disabled"
        ),
        KeyStatus::Cooling { until } => tracing::info!(
            key_id = %key.id,
            from = before.label(),
            failures = key.consecutive_failures,
            until = %until,
            "Key cooling down"
        ),
        KeyStatus::Active => tracing::info!(key_id = %key.id, from = before.label(), "Key active"),
    }
}
