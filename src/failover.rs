//! Failover coordinator — retry-with-different-key for one inbound request.
//!
//! Each request runs an explicit state machine:
//!
//! ```text
//! Selecting ──▶ Attempting ──▶ Success
//!     ▲              │
//!     └── Retrying ◀─┘──▶ Exhausted
//! ```
//!
//! Every attempt runs as its own task that forwards the call and reports
//! the outcome to the health tracker. If the caller goes away or the
//! deadline passes, the coordinator stops starting new attempts but the
//! in-flight attempt still settles and is recorded.

use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, PoolError};
use crate::health::HealthTracker;
use crate::key::Key;
use crate::outcome::{AttemptRecord, FailureReason, Outcome, RetryReason};
use crate::selection::SelectionStrategy;
use crate::upstream::{Forwarded, UpstreamClient, UpstreamRequest, UpstreamResponse};

/// Default bound on attempts per request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ── Request State ───────────────────────────────────────────────────

enum State {
    Selecting,
    Attempting(String),
    Retrying(FailureReason),
    Success(UpstreamResponse),
    Exhausted,
}

/// Bookkeeping for one logical request. Dropped when the request ends.
struct RequestRun {
    request_id: String,
    attempts: u32,
    excluded: BTreeSet<String>,
    last_reason: Option<FailureReason>,
}

/// How the caller can stop a request early.
#[derive(Debug, Clone, Default)]
pub struct RequestControl {
    pub cancel: CancellationToken,
    pub deadline: Option<tokio::time::Instant>,
}

// ── Coordinator ─────────────────────────────────────────────────────

pub struct FailoverCoordinator {
    tracker: Arc<HealthTracker>,
    upstream: Arc<dyn UpstreamClient>,
    strategy: RwLock<SelectionStrategy>,
    max_attempts: u32,
}

impl FailoverCoordinator {
    pub fn new(
        tracker: Arc<HealthTracker>,
        upstream: Arc<dyn UpstreamClient>,
        strategy: SelectionStrategy,
        max_attempts: u32,
    ) -> Self {
        Self {
            tracker,
            upstream,
            strategy: RwLock::new(strategy),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    pub fn strategy(&self) -> SelectionStrategy {
        *self.strategy.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        *self.strategy.write().unwrap_or_else(|e| e.into_inner()) = strategy;
        tracing::info!(strategy = strategy.name(), "Selection strategy changed");
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drive one request to completion.
    pub async fn run(
        &self,
        request: UpstreamRequest,
        control: RequestControl,
    ) -> Result<UpstreamResponse, GatewayError> {
        let request = Arc::new(request);
        let mut run = RequestRun {
            request_id: uuid::Uuid::new_v4().to_string(),
            attempts: 0,
            excluded: BTreeSet::new(),
            last_reason: None,
        };
        let mut state = State::Selecting;

        loop {
            state = match state {
                State::Selecting => {
                    if control.cancel.is_cancelled() {
                        return Err(GatewayError::Cancelled { attempts: run.attempts });
                    }
                    if control.deadline.is_some_and(|d| d <= tokio::time::Instant::now()) {
                        return Err(GatewayError::DeadlineExceeded { attempts: run.attempts });
                    }
                    let pool = self.tracker.snapshot();
                    match self.strategy().select(&pool, &run.excluded) {
                        Ok(key_id) => State::Attempting(key_id),
                        Err(PoolError::NoEligibleKey) => State::Exhausted,
                        Err(e) => return Err(e.into()),
                    }
                }

                State::Attempting(key_id) => {
                    run.excluded.insert(key_id.clone());
                    let key = match self.tracker.store().get(&key_id) {
                        Ok(key) => key,
                        // Removed between snapshot and attempt.
                        Err(PoolError::NotFound(_)) => {
                            state = State::Selecting;
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    run.attempts += 1;

                    let handle = self.spawn_attempt(&run.request_id, key, Arc::clone(&request));
                    let settled = tokio::select! {
                        biased;
                        joined = handle => joined,
                        _ = control.cancel.cancelled() => {
                            tracing::debug!(request_id = %run.request_id, "Caller cancelled; attempt left to settle");
                            return Err(GatewayError::Cancelled { attempts: run.attempts });
                        }
                        _ = deadline_elapsed(control.deadline) => {
                            tracing::debug!(request_id = %run.request_id, "Deadline passed; attempt left to settle");
                            return Err(GatewayError::DeadlineExceeded { attempts: run.attempts });
                        }
                    };

                    let (forwarded, reported) = match settled {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(request_id = %run.request_id, key_id = %key_id, error = %e, "Attempt task aborted");
                            state = State::Retrying(FailureReason::Retryable(
                                RetryReason::TransientUpstreamError,
                            ));
                            continue;
                        }
                    };
                    match reported {
                        Ok(()) | Err(PoolError::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }

                    match forwarded.outcome.failure_reason() {
                        None => State::Success(forwarded.response.unwrap_or(UpstreamResponse {
                            status: 200,
                            body: serde_json::Value::Null,
                        })),
                        Some(reason) => State::Retrying(reason),
                    }
                }

                State::Retrying(reason) => {
                    run.last_reason = Some(reason);
                    if run.attempts < self.max_attempts {
                        tracing::debug!(
                            request_id = %run.request_id,
                            attempts = run.attempts,
                            reason = %reason,
                            "Failing over to another key"
                        );
                        State::Selecting
                    } else {
                        State::Exhausted
                    }
                }

                State::Success(response) => {
                    tracing::debug!(request_id = %run.request_id, attempts = run.attempts, "Request completed");
                    return Ok(response);
                }

                State::Exhausted => {
                    return Err(match run.last_reason {
                        None => {
                            tracing::warn!(request_id = %run.request_id, "No eligible key for request");
                            GatewayError::NoEligibleKey
                        }
                        Some(last_reason) => {
                            tracing::warn!(
                                request_id = %run.request_id,
                                attempts = run.attempts,
                                last_reason = %last_reason,
                                "Request exhausted"
                            );
                            GatewayError::Exhausted { attempts: run.attempts, last_reason }
                        }
                    });
                }
            };
        }
    }

    /// Forward under `key` and report the outcome, detached from the caller.
    fn spawn_attempt(
        &self,
        request_id: &str,
        key: Key,
        request: Arc<UpstreamRequest>,
    ) -> tokio::task::JoinHandle<(Forwarded, Result<(), PoolError>)> {
        let tracker = Arc::clone(&self.tracker);
        let upstream = Arc::clone(&self.upstream);
        let request_id = request_id.to_string();

        tokio::spawn(async move {
            let started = Instant::now();
            let forwarded = match AssertUnwindSafe(upstream.forward(&key, &request))
                .catch_unwind()
                .await
            {
                Ok(forwarded) => forwarded,
                Err(_) => {
                    tracing::error!(key_id = %key.id, "Upstream client panicked");
                    Forwarded {
                        outcome: Outcome::RetryableFailure(RetryReason::TransientUpstreamError),
                        response: None,
                    }
                }
            };
            let record = AttemptRecord {
                request_id,
                key_id: key.id.clone(),
                at: tracker.clock().now(),
                outcome: forwarded.outcome,
                latency: started.elapsed(),
            };
            let reported = match tracker.report(&record) {
                Ok(_) => Ok(()),
                Err(PoolError::NotFound(id)) => {
                    tracing::warn!(key_id = %id, "Key removed before its attempt was recorded");
                    Err(PoolError::NotFound(id))
                }
                Err(e) => {
                    tracing::error!(key_id = %record.key_id, error = %e, "Failed to record attempt");
                    Err(e)
                }
            };
            (forwarded, reported)
        })
    }
}

async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::health::HealthPolicy;
    use crate::key::{KeyStatus, Secret};
    use crate::outcome::FatalReason;
    use crate::store::tests::{flaky_store, memory_store};
    use crate::store::CredentialStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Upstream that replays a per-key script; unscripted calls succeed.
    #[derive(Default)]
    struct ScriptedUpstream {
        script: Mutex<HashMap<String, VecDeque<Outcome>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        fn on(self, key_id: &str, outcomes: &[Outcome]) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(key_id.to_string(), outcomes.iter().copied().collect());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedUpstream {
        async fn forward(&self, key: &Key, _request: &UpstreamRequest) -> Forwarded {
            self.calls.lock().unwrap().push(key.id.clone());
            let outcome = self
                .script
                .lock()
                .unwrap()
                .get_mut(&key.id)
                .and_then(|q| q.pop_front())
                .unwrap_or(Outcome::Success { cost: None });
            Forwarded {
                outcome,
                response: Some(UpstreamResponse {
                    status: 200,
                    body: serde_json::json!({ "served_by": key.id }),
                }),
            }
        }
    }

    /// Upstream that blocks until released, then reports a rate limit.
    struct GatedUpstream {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl UpstreamClient for GatedUpstream {
        async fn forward(&self, _key: &Key, _request: &UpstreamRequest) -> Forwarded {
            self.gate.notified().await;
            Forwarded {
                outcome: Outcome::RetryableFailure(RetryReason::RateLimited),
                response: None,
            }
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()))
    }

    fn tracker_over(store: CredentialStore) -> Arc<HealthTracker> {
        Arc::new(HealthTracker::new(Arc::new(store), clock(), HealthPolicy::default()))
    }

    fn add(tracker: &HealthTracker, secret: &str) -> String {
        let key = Key::new(Secret::new(secret), None, tracker.clock().now());
        tracker.store().insert(key).unwrap().id
    }

    fn coordinator(tracker: &Arc<HealthTracker>, upstream: Arc<dyn UpstreamClient>) -> FailoverCoordinator {
        FailoverCoordinator::new(
            Arc::clone(tracker),
            upstream,
            SelectionStrategy::LeastRecentlyUsed,
            DEFAULT_MAX_ATTEMPTS,
        )
    }

    fn request() -> UpstreamRequest {
        UpstreamRequest::new("gemini-2.0-flash", serde_json::json!({"contents": []}))
    }

    /// Two keys, ordered so that `first` is picked before `second`.
    fn two_keys(tracker: &HealthTracker) -> (String, String) {
        let a = add(tracker, "AIzaSyAlphaAlphaAlpha");
        let b = add(tracker, "AIzaSyBravoBravoBravo");
        if a < b { (a, b) } else { (b, a) }
    }

    #[tokio::test]
    async fn test_fails_over_to_second_key() {
        let tracker = tracker_over(memory_store());
        let (first, second) = two_keys(&tracker);
        let upstream = Arc::new(
            ScriptedUpstream::default()
                .on(&first, &[Outcome::RetryableFailure(RetryReason::TransientUpstreamError)]),
        );
        let coord = coordinator(&tracker, upstream.clone());

        let response = coord.run(request(), RequestControl::default()).await.unwrap();
        assert_eq!(response.body["served_by"], second.as_str());
        assert_eq!(upstream.calls(), vec![first.clone(), second.clone()]);

        let pool = tracker.snapshot();
        assert_eq!(pool.get(&first).unwrap().consecutive_failures, 1);
        assert!(pool.get(&second).unwrap().last_success_at.is_some());

        let attempts = tracker.store().recent_attempts(None, 10).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].request_id, attempts[1].request_id);
    }

    #[tokio::test]
    async fn test_fatal_failure_does_not_abort_request() {
        let tracker = tracker_over(memory_store());
        let (first, second) = two_keys(&tracker);
        let upstream = Arc::new(
            ScriptedUpstream::default()
                .on(&first, &[Outcome::FatalFailure(FatalReason::InvalidCredential)]),
        );
        let coord = coordinator(&tracker, upstream.clone());

        let response = coord.run(request(), RequestControl::default()).await.unwrap();
        assert_eq!(response.body["served_by"], second.as_str());
        assert_eq!(tracker.store().get(&first).unwrap().status, KeyStatus::Disabled);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let tracker = tracker_over(memory_store());
        let mut ids = Vec::new();
        for s in ["AIzaSyAlphaAlphaAlpha", "AIzaSyBravoBravoBravo", "AIzaSyCharlieCharlie", "AIzaSyDeltaDeltaDelta"] {
            ids.push(add(&tracker, s));
        }
        let mut upstream = ScriptedUpstream::default();
        for id in &ids {
            upstream = upstream.on(id, &[Outcome::RetryableFailure(RetryReason::RateLimited)]);
        }
        let upstream = Arc::new(upstream);
        let coord = coordinator(&tracker, upstream.clone());

        let err = coord.run(request(), RequestControl::default()).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Exhausted {
                attempts: 3,
                last_reason: FailureReason::Retryable(RetryReason::RateLimited),
            }
        );
        assert_eq!(upstream.calls().len(), 3);
        let distinct: BTreeSet<_> = upstream.calls().into_iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn test_runs_out_of_keys_before_bound() {
        let tracker = tracker_over(memory_store());
        let only = add(&tracker, "AIzaSyAlphaAlphaAlpha");
        let upstream = Arc::new(
            ScriptedUpstream::default()
                .on(&only, &[Outcome::RetryableFailure(RetryReason::TransientUpstreamError)]),
        );
        let coord = coordinator(&tracker, upstream);

        let err = coord.run(request(), RequestControl::default()).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Exhausted {
                attempts: 1,
                last_reason: FailureReason::Retryable(RetryReason::TransientUpstreamError),
            }
        );
    }

    #[tokio::test]
    async fn test_empty_pool_is_no_eligible_key() {
        let tracker = tracker_over(memory_store());
        let coord = coordinator(&tracker, Arc::new(ScriptedUpstream::default()));
        let err = coord.run(request(), RequestControl::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::NoEligibleKey);
    }

    #[tokio::test]
    async fn test_store_failure_while_reporting_fails_request() {
        let (store, down) = flaky_store();
        let tracker = tracker_over(store);
        add(&tracker, "AIzaSyAlphaAlphaAlpha");
        let coord = coordinator(&tracker, Arc::new(ScriptedUpstream::default()));

        down.store(true, Ordering::SeqCst);
        let err = coord.run(request(), RequestControl::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_cancelled_attempt_still_reports() {
        let tracker = tracker_over(memory_store());
        let id = add(&tracker, "AIzaSyAlphaAlphaAlpha");
        let gate = Arc::new(Notify::new());
        let coord = coordinator(&tracker, Arc::new(GatedUpstream { gate: Arc::clone(&gate) }));

        let control = RequestControl::default();
        let cancel = control.cancel.clone();
        let run = coord.run(request(), control);
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, canceller);
        assert_eq!(result, Err(GatewayError::Cancelled { attempts: 1 }));
        assert!(tracker.store().recent_attempts(None, 10).unwrap().is_empty());

        gate.notify_one();
        let mut recorded = false;
        for _ in 0..200 {
            if !tracker.store().recent_attempts(Some(&id), 10).unwrap().is_empty() {
                recorded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recorded, "in-flight attempt was never recorded");
        assert!(matches!(tracker.store().get(&id).unwrap().status, KeyStatus::Cooling { .. }));
    }

    #[tokio::test]
    async fn test_deadline_stops_new_attempts() {
        let tracker = tracker_over(memory_store());
        add(&tracker, "AIzaSyAlphaAlphaAlpha");
        let gate = Arc::new(Notify::new());
        let coord = coordinator(&tracker, Arc::new(GatedUpstream { gate: Arc::clone(&gate) }));

        let control = RequestControl {
            cancel: CancellationToken::new(),
            deadline: Some(tokio::time::Instant::now() + Duration::from_millis(20)),
        };
        let err = coord.run(request(), control).await.unwrap_err();
        assert_eq!(err, GatewayError::DeadlineExceeded { attempts: 1 });
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_strategy_can_be_swapped() {
        let tracker = tracker_over(memory_store());
        let (first, _) = two_keys(&tracker);
        let coord = coordinator(&tracker, Arc::new(ScriptedUpstream::default()));
        coord.set_strategy(SelectionStrategy::Sticky { usage_threshold: 100 });
        assert_eq!(coord.strategy(), SelectionStrategy::Sticky { usage_threshold: 100 });

        for _ in 0..3 {
            let response = coord.run(request(), RequestControl::default()).await.unwrap();
            assert_eq!(response.body["served_by"], first.as_str());
        }
        assert_eq!(tracker.store().get(&first).unwrap().quota_used, 3);
    }

    /// Upstream that panics for one key and succeeds for the rest.
    struct PanickingUpstream {
        bad: String,
    }

    #[async_trait]
    impl UpstreamClient for PanickingUpstream {
        async fn forward(&self, key: &Key, _request: &UpstreamRequest) -> Forwarded {
            if key.id == self.bad {
                panic!("client bug");
            }
            Forwarded {
                outcome: Outcome::Success { cost: None },
                response: Some(UpstreamResponse {
                    status: 200,
                    body: serde_json::json!({ "served_by": key.id }),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_panicking_client_counts_as_transient_failure() {
        let tracker = tracker_over(memory_store());
        let (first, second) = two_keys(&tracker);
        let coord = coordinator(&tracker, Arc::new(PanickingUpstream { bad: first.clone() }));

        let response = coord.run(request(), RequestControl::default()).await.unwrap();
        assert_eq!(response.body["served_by"], second.as_str());

        let failed = tracker.store().get(&first).unwrap();
        assert_eq!(failed.consecutive_failures, 1);
        let recorded = tracker.store().recent_attempts(Some(&first), 10).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(
            recorded[0].outcome,
            Outcome::RetryableFailure(RetryReason::TransientUpstreamError)
        );
    }
}
