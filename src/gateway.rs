//! Gateway facade — the boundary an outer server calls into.
//!
//! `handle` is the single request entry point. Everything else here is
//! administration and observability over the same pool.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::GatewayError;
use crate::failover::{FailoverCoordinator, RequestControl, DEFAULT_MAX_ATTEMPTS};
use crate::health::{HealthPolicy, HealthTracker};
use crate::key::{Key, KeyStatus, KeyView, Secret};
use crate::outcome::AttemptRecord;
use crate::selection::SelectionStrategy;
use crate::store::{AttemptStats, CredentialStore};
use crate::upstream::{UpstreamClient, UpstreamRequest, UpstreamResponse};

const MAX_PAGE_SIZE: usize = 100;
const MAX_ATTEMPT_LISTING: usize = 500;

// ── Options ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub policy: HealthPolicy,
    pub strategy: SelectionStrategy,
    pub max_attempts: u32,
    pub request_timeout: Option<Duration>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            policy: HealthPolicy::default(),
            strategy: SelectionStrategy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: None,
        }
    }
}

impl GatewayOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.health.clone(),
            strategy: config.selection.strategy(),
            max_attempts: config.failover.max_attempts,
            request_timeout: config.failover.request_timeout(),
        }
    }
}

// ── Observability Types ─────────────────────────────────────────────

/// One key with its rolling 24h attempt aggregates.
#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    #[serde(flatten)]
    pub key: KeyView,
    pub last_24h: AttemptStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub generated_at: DateTime<Utc>,
    pub strategy: SelectionStrategy,
    pub total: usize,
    pub active: usize,
    pub cooling: usize,
    pub disabled: usize,
    pub keys: Vec<KeySummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Active,
    Cooling,
    Disabled,
}

impl StatusFilter {
    fn matches(&self, status: &KeyStatus) -> bool {
        matches!(
            (self, status),
            (StatusFilter::Active, KeyStatus::Active)
                | (StatusFilter::Cooling, KeyStatus::Cooling { .. })
                | (StatusFilter::Disabled, KeyStatus::Disabled)
        )
    }
}

/// Filtered, paginated key listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeyQuery {
    pub status: Option<StatusFilter>,
    /// Case-insensitive match against the id or the redacted secret.
    pub search: Option<String>,
    pub min_failures: Option<u32>,
    /// 1-based.
    pub page: usize,
    pub per_page: usize,
}

impl Default for KeyQuery {
    fn default() -> Self {
        Self {
            status: None,
            search: None,
            min_failures: None,
            page: 1,
            per_page: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub pages: usize,
}

// ── Gateway ─────────────────────────────────────────────────────────

pub struct Gateway {
    coordinator: FailoverCoordinator,
    tracker: Arc<HealthTracker>,
    request_timeout: Option<Duration>,
}

impl Gateway {
    pub fn new(
        store: Arc<CredentialStore>,
        upstream: Arc<dyn UpstreamClient>,
        clock: Arc<dyn Clock>,
        options: GatewayOptions,
    ) -> Self {
        let tracker = Arc::new(HealthTracker::new(store, clock, options.policy));
        let coordinator = FailoverCoordinator::new(
            Arc::clone(&tracker),
            upstream,
            options.strategy,
            options.max_attempts,
        );
        Self {
            coordinator,
            tracker,
            request_timeout: options.request_timeout,
        }
    }

    fn store(&self) -> &CredentialStore {
        self.tracker.store()
    }

    fn now(&self) -> DateTime<Utc> {
        self.tracker.clock().now()
    }

    // ── Requests ────────────────────────────────────────────────────

    /// Forward one request through the pool.
    pub async fn handle(&self, request: UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        self.handle_with_cancel(request, CancellationToken::new()).await
    }

    /// Like [`Gateway::handle`], stopping early once `cancel` fires.
    pub async fn handle_with_cancel(
        &self,
        request: UpstreamRequest,
        cancel: CancellationToken,
    ) -> Result<UpstreamResponse, GatewayError> {
        request.validate().map_err(GatewayError::InvalidRequest)?;
        let control = RequestControl {
            cancel,
            deadline: self
                .request_timeout
                .map(|timeout| tokio::time::Instant::now() + timeout),
        };
        self.coordinator.run(request, control).await
    }

    // ── Administration ──────────────────────────────────────────────

    /// Import a secret. Re-adding a known secret returns the existing key,
    /// updating its quota limit if one is given.
    pub fn add_key(&self, secret: &str, quota_limit: Option<u64>) -> Result<KeyView, GatewayError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(GatewayError::InvalidRequest("secret must not be empty".into()));
        }
        let key = self
            .store()
            .insert(Key::new(Secret::new(secret), quota_limit, self.now()))?;
        if quota_limit.is_some() && key.quota_limit != quota_limit {
            return Ok(self.tracker.set_quota_limit(&key.id, quota_limit)?.view());
        }
        Ok(key.view())
    }

    /// Detach a key from the pool; its attempt history is kept.
    pub fn remove_key(&self, id: &str) -> Result<(), GatewayError> {
        Ok(self.store().remove(id, self.now())?)
    }

    pub fn reset_key(&self, id: &str) -> Result<KeyView, GatewayError> {
        Ok(self.tracker.reset_key(id)?.view())
    }

    pub fn reset_usage(&self) -> Result<usize, GatewayError> {
        Ok(self.tracker.reset_usage()?)
    }

    pub fn reset_failures(&self) -> Result<usize, GatewayError> {
        Ok(self.tracker.reset_failures()?)
    }

    pub fn set_quota(&self, id: &str, limit: Option<u64>) -> Result<KeyView, GatewayError> {
        Ok(self.tracker.set_quota_limit(id, limit)?.view())
    }

    pub fn set_strategy(&self, strategy: SelectionStrategy) -> Result<(), GatewayError> {
        if let SelectionStrategy::Sticky { usage_threshold: 0 } = strategy {
            return Err(GatewayError::InvalidRequest("usage_threshold must be at least 1".into()));
        }
        self.coordinator.set_strategy(strategy);
        Ok(())
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.coordinator.strategy()
    }

    // ── Observability ───────────────────────────────────────────────

    pub fn get_key(&self, id: &str) -> Result<KeyView, GatewayError> {
        Ok(self.store().get(id)?.view())
    }

    /// Status totals plus per-key state and last-24h attempt aggregates.
    pub fn pool_summary(&self) -> Result<PoolSummary, GatewayError> {
        let now = self.now();
        let pool = self.tracker.snapshot();
        let mut stats = self
            .store()
            .attempt_stats_since(now - ChronoDuration::hours(24))?;

        let keys = pool
            .keys()
            .iter()
            .map(|k| KeySummary {
                key: k.view(),
                last_24h: stats.remove(&k.id).unwrap_or_default(),
            })
            .collect();

        Ok(PoolSummary {
            generated_at: now,
            strategy: self.strategy(),
            total: pool.len(),
            active: pool.count_where(|s| matches!(s, KeyStatus::Active)),
            cooling: pool.count_where(|s| matches!(s, KeyStatus::Cooling { .. })),
            disabled: pool.count_where(|s| matches!(s, KeyStatus::Disabled)),
            keys,
        })
    }

    pub fn list_keys(&self, query: &KeyQuery) -> Result<Page<KeyView>, GatewayError> {
        if query.page == 0 {
            return Err(GatewayError::InvalidRequest("page is 1-based".into()));
        }
        if query.per_page == 0 || query.per_page > MAX_PAGE_SIZE {
            return Err(GatewayError::InvalidRequest(format!(
                "per_page must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let needle = query.search.as_deref().map(str::to_lowercase);
        let matching: Vec<KeyView> = self
            .tracker
            .snapshot()
            .keys()
            .iter()
            .filter(|k| query.status.map_or(true, |f| f.matches(&k.status)))
            .filter(|k| query.min_failures.map_or(true, |n| k.consecutive_failures >= n))
            .map(Key::view)
            .filter(|v| {
                needle.as_deref().map_or(true, |n| {
                    v.id.to_lowercase().contains(n) || v.secret.to_lowercase().contains(n)
                })
            })
            .collect();

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip((query.page - 1).saturating_mul(query.per_page))
            .take(query.per_page)
            .collect();
        Ok(Page {
            items,
            total,
            page: query.page,
            per_page: query.per_page,
            pages: total.div_ceil(query.per_page),
        })
    }

    /// Most recent attempt records, newest first.
    pub fn recent_attempts(
        &self,
        key_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AttemptRecord>, GatewayError> {
        Ok(self
            .store()
            .recent_attempts(key_id, limit.min(MAX_ATTEMPT_LISTING))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::outcome::{FatalReason, Outcome, RetryReason};
    use crate::store::tests::memory_store;
    use crate::upstream::Forwarded;
    use async_trait::async_trait;
    use chrono::TimeZone;

    /// Rate-limits every key whose secret contains "Busy"; serves the rest.
    struct BusyUpstream;

    #[async_trait]
    impl UpstreamClient for BusyUpstream {
        async fn forward(&self, key: &Key, _request: &UpstreamRequest) -> Forwarded {
            let outcome = if key.secret.expose().contains("Busy") {
                Outcome::RetryableFailure(RetryReason::RateLimited)
            } else if key.secret.expose().contains("Revoked") {
                Outcome::FatalFailure(FatalReason::InvalidCredential)
            } else {
                Outcome::Success { cost: None }
            };
            Forwarded {
                outcome,
                response: Some(UpstreamResponse { status: 200, body: serde_json::json!({"ok": true}) }),
            }
        }
    }

    fn gateway() -> (Gateway, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()));
        let gw = Gateway::new(
            Arc::new(memory_store()),
            Arc::new(BusyUpstream),
            clock.clone(),
            GatewayOptions::default(),
        );
        (gw, clock)
    }

    fn request() -> UpstreamRequest {
        UpstreamRequest::new("gemini-2.0-flash", serde_json::json!({"contents": []}))
    }

    #[tokio::test]
    async fn test_handle_rejects_bad_model() {
        let (gw, _) = gateway();
        gw.add_key("AIzaSyGoodGoodGoodGood", None).unwrap();
        let err = gw
            .handle(UpstreamRequest::new("../etc", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_summary_counts_and_stats() {
        let (gw, _) = gateway();
        gw.add_key("AIzaSyBusyBusyBusyBusy", None).unwrap();
        gw.add_key("AIzaSyRevokedRevoked", None).unwrap();
        let good = gw.add_key("AIzaSyGoodGoodGoodGood", None).unwrap();

        // Whatever order the keys are tried in, the good one serves.
        gw.handle(request()).await.unwrap();

        let summary = gw.pool_summary().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.active + summary.cooling + summary.disabled, 3);
        let good_summary = summary.keys.iter().find(|k| k.key.id == good.id).unwrap();
        assert_eq!(good_summary.last_24h.successes, 1);
        assert_eq!(good_summary.last_24h.requests, 1);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["strategy"]["strategy"], "least_recently_used");
        assert!(!json.to_string().contains("GoodGoodGood"));
    }

    #[test]
    fn test_add_key_is_idempotent_and_updates_quota() {
        let (gw, _) = gateway();
        let first = gw.add_key("  AIzaSyGoodGoodGoodGood \n", None).unwrap();
        let again = gw.add_key("AIzaSyGoodGoodGoodGood", Some(100)).unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.quota_limit, Some(100));
        assert_eq!(gw.pool_summary().unwrap().total, 1);

        assert!(matches!(gw.add_key("   ", None), Err(GatewayError::InvalidRequest(_))));
    }

    #[test]
    fn test_remove_and_not_found() {
        let (gw, _) = gateway();
        let key = gw.add_key("AIzaSyGoodGoodGoodGood", None).unwrap();
        gw.remove_key(&key.id).unwrap();
        assert_eq!(gw.remove_key(&key.id), Err(GatewayError::NotFound(key.id.clone())));
        assert_eq!(gw.reset_key(&key.id).unwrap_err().status_code(), http::StatusCode::NOT_FOUND);

        // Re-adding brings it back.
        gw.add_key("AIzaSyGoodGoodGoodGood", None).unwrap();
        assert!(gw.get_key(&key.id).is_ok());
    }

    #[test]
    fn test_list_keys_filters_and_pages() {
        let (gw, _) = gateway();
        let revoked = gw.add_key("AIzaSyRevokedRevoked", None).unwrap();
        for s in ["AIzaSyGood1Good1Good1", "AIzaSyGood2Good2Good2", "AIzaSyGood3Good3Good3"] {
            gw.add_key(s, None).unwrap();
        }

        let all = gw.list_keys(&KeyQuery { per_page: 2, ..KeyQuery::default() }).unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.items.len(), 2);
        assert_eq!(all.pages, 2);

        let second = gw
            .list_keys(&KeyQuery { per_page: 2, page: 2, ..KeyQuery::default() })
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert_ne!(second.items[0].id, all.items[0].id);

        let searched = gw
            .list_keys(&KeyQuery { search: Some(revoked.id.to_uppercase()), ..KeyQuery::default() })
            .unwrap();
        assert_eq!(searched.total, 1);

        assert!(gw.list_keys(&KeyQuery { page: 0, ..KeyQuery::default() }).is_err());
        assert!(gw.list_keys(&KeyQuery { per_page: 1000, ..KeyQuery::default() }).is_err());
    }

    #[test]
    fn test_status_filter() {
        let (gw, _) = gateway();
        let a = gw.add_key("AIzaSyGood1Good1Good1", None).unwrap();
        gw.add_key("AIzaSyGood2Good2Good2", None).unwrap();
        gw.set_quota(&a.id, Some(0)).unwrap();

        let cooling = gw
            .list_keys(&KeyQuery { status: Some(StatusFilter::Cooling), ..KeyQuery::default() })
            .unwrap();
        assert_eq!(cooling.total, 1);
        assert_eq!(cooling.items[0].id, a.id);

        let active = gw
            .list_keys(&KeyQuery { status: Some(StatusFilter::Active), ..KeyQuery::default() })
            .unwrap();
        assert_eq!(active.total, 1);

        let failing = gw
            .list_keys(&KeyQuery { min_failures: Some(1), ..KeyQuery::default() })
            .unwrap();
        assert_eq!(failing.total, 0);
    }

    #[test]
    fn test_set_strategy_validates() {
        let (gw, _) = gateway();
        assert!(gw.set_strategy(SelectionStrategy::Sticky { usage_threshold: 0 }).is_err());
        gw.set_strategy(SelectionStrategy::Random { seed: 9 }).unwrap();
        assert_eq!(gw.strategy(), SelectionStrategy::Random { seed: 9 });
    }

    #[tokio::test]
    async fn test_request_timeout_becomes_deadline() {
        struct Hang;
        #[async_trait]
        impl UpstreamClient for Hang {
            async fn forward(&self, _key: &Key, _request: &UpstreamRequest) -> Forwarded {
                std::future::pending().await
            }
        }

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()));
        let gw = Gateway::new(
            Arc::new(memory_store()),
            Arc::new(Hang),
            clock,
            GatewayOptions {
                request_timeout: Some(Duration::from_millis(20)),
                ..GatewayOptions::default()
            },
        );
        gw.add_key("AIzaSyGoodGoodGoodGood", None).unwrap();
        let err = gw.handle(request()).await.unwrap_err();
        assert_eq!(err, GatewayError::DeadlineExceeded { attempts: 1 });
    }
}
