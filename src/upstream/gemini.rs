//! Google Gemini client — the generativelanguage REST API.
//!
//! The key travels in the `x-goog-api-key` header, never in the URL, so it
//! cannot leak into proxy or access logs.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{Forwarded, UpstreamClient, UpstreamRequest, UpstreamResponse};
use crate::key::Key;
use crate::outcome::{FatalReason, Outcome, RetryReason};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, request: &UpstreamRequest) -> String {
        let model = request.model.strip_prefix("models/").unwrap_or(&request.model);
        format!("{}/models/{}:{}", self.base_url, model, request.method)
    }
}

#[async_trait]
impl UpstreamClient for GeminiClient {
    async fn forward(&self, key: &Key, request: &UpstreamRequest) -> Forwarded {
        let resp = self
            .client
            .post(self.url(request))
            .header("x-goog-api-key", key.secret.expose())
            .json(&request.body)
            .send()
            .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(
                    key_id = %key.id,
                    timeout = e.is_timeout(),
                    connect = e.is_connect(),
                    "Upstream transport error"
                );
                return Forwarded {
                    outcome: Outcome::RetryableFailure(RetryReason::TransientUpstreamError),
                    response: None,
                };
            }
        };

        let status = resp.status().as_u16();
        let body = match resp.text().await {
            Ok(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            // Body cut off mid-stream.
            Err(_) => {
                return Forwarded {
                    outcome: Outcome::RetryableFailure(RetryReason::TransientUpstreamError),
                    response: None,
                }
            }
        };

        Forwarded {
            outcome: classify(status, &body),
            response: Some(UpstreamResponse { status, body }),
        }
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Map an upstream status and error body onto an [`Outcome`].
///
/// Client errors that are not about the key (a malformed request, an
/// unknown model) count as a success for the key: the caller gets the
/// upstream's answer and the key stays healthy.
pub fn classify(status: u16, body: &Value) -> Outcome {
    let error = &body["error"];
    match status {
        200..=299 => Outcome::Success { cost: None },
        429 if is_permanent_quota(error) => {
            Outcome::FatalFailure(FatalReason::QuotaExhaustedPermanently)
        }
        429 => Outcome::RetryableFailure(RetryReason::RateLimited),
        401 | 403 => Outcome::FatalFailure(FatalReason::InvalidCredential),
        400 if is_invalid_key(error) => Outcome::FatalFailure(FatalReason::InvalidCredential),
        500..=599 => Outcome::RetryableFailure(RetryReason::TransientUpstreamError),
        _ => Outcome::Success { cost: None },
    }
}

fn details(error: &Value) -> impl Iterator<Item = &Value> {
    error["details"].as_array().into_iter().flatten()
}

fn is_invalid_key(error: &Value) -> bool {
    let message = error["message"].as_str().unwrap_or_default();
    message.contains("API key not valid")
        || details(error).any(|d| d["reason"].as_str() == Some("API_KEY_INVALID"))
}

/// A daily quota with a limit of zero will not recover by waiting.
fn is_permanent_quota(error: &Value) -> bool {
    let message = error["message"].as_str().unwrap_or_default();
    let violations: Vec<&Value> = details(error)
        .flat_map(|d| d["violations"].as_array().into_iter().flatten())
        .collect();

    let daily = message.contains("PerDay")
        || message.to_lowercase().contains("per day")
        || violations.iter().any(|v| {
            v["quotaId"].as_str().is_some_and(|id| id.contains("PerDay"))
        });
    let zero = message.contains("limit: 0")
        || violations.iter().any(|v| v["quotaValue"].as_str() == Some("0"));
    daily && zero
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_success_and_rate_limit() {
        assert_eq!(classify(200, &json!({"candidates": []})), Outcome::Success { cost: None });
        let rpm = json!({"error": {
            "code": 429,
            "status": "RESOURCE_EXHAUSTED",
            "message": "Quota exceeded for metric: generativelanguage.googleapis.com/generate_content_free_tier_requests, limit: 15",
            "details": [{"violations": [{"quotaId": "GenerateRequestsPerMinutePerProjectPerModel-FreeTier", "quotaValue": "15"}]}]
        }});
        assert_eq!(classify(429, &rpm), Outcome::RetryableFailure(RetryReason::RateLimited));
    }

    #[test]
    fn test_classify_daily_zero_quota_is_permanent() {
        let daily = json!({"error": {
            "code": 429,
            "message": "Quota exceeded for metric: generativelanguage.googleapis.com/generate_content_free_tier_requests, limit: 0",
            "details": [{
                "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                "violations": [{"quotaId": "GenerateRequestsPerDayPerProjectPerModel-FreeTier", "quotaValue": "0"}]
            }]
        }});
        assert_eq!(
            classify(429, &daily),
            Outcome::FatalFailure(FatalReason::QuotaExhaustedPermanently)
        );

        // Daily limit that is merely used up still recovers.
        let used_up = json!({"error": {
            "message": "Quota exceeded",
            "details": [{"violations": [{"quotaId": "GenerateRequestsPerDayPerProjectPerModel-FreeTier", "quotaValue": "1500"}]}]
        }});
        assert_eq!(classify(429, &used_up), Outcome::RetryableFailure(RetryReason::RateLimited));
    }

    #[test]
    fn test_classify_credential_errors() {
        assert_eq!(classify(401, &Value::Null), Outcome::FatalFailure(FatalReason::InvalidCredential));
        assert_eq!(classify(403, &Value::Null), Outcome::FatalFailure(FatalReason::InvalidCredential));

        let invalid = json!({"error": {
            "code": 400,
            "message": "API key not valid. Please pass a valid API key.",
            "status": "INVALID_ARGUMENT",
            "details": [{"reason": "API_KEY_INVALID", "domain": "googleapis.com"}]
        }});
        assert_eq!(classify(400, &invalid), Outcome::FatalFailure(FatalReason::InvalidCredential));
    }

    #[test]
    fn test_classify_bad_request_keeps_key_healthy() {
        let bad = json!({"error": {"code": 400, "message": "Invalid JSON payload received.", "status": "INVALID_ARGUMENT"}});
        assert_eq!(classify(400, &bad), Outcome::Success { cost: None });
        assert_eq!(classify(404, &Value::Null), Outcome::Success { cost: None });
    }

    #[test]
    fn test_classify_server_errors_are_transient() {
        for status in [500, 502, 503, 504] {
            assert_eq!(
                classify(status, &Value::Null),
                Outcome::RetryableFailure(RetryReason::TransientUpstreamError)
            );
        }
    }

    #[test]
    fn test_url_strips_models_prefix() {
        let client = GeminiClient::new("https://example.test/v1beta/", Duration::from_secs(5)).unwrap();
        let req = UpstreamRequest::new("models/gemini-2.0-flash", Value::Null);
        assert_eq!(
            client.url(&req),
            "https://example.test/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Port 9 on localhost is reserved and closed in test environments.
        let client = GeminiClient::new("http://127.0.0.1:9/v1beta", Duration::from_secs(2)).unwrap();
        let key = Key::new(crate::key::Secret::new("AIzaSyTransportTransport"), None, chrono::Utc::now());
        let forwarded = client
            .forward(&key, &UpstreamRequest::new("gemini-pro", json!({})))
            .await;
        assert_eq!(
            forwarded.outcome,
            Outcome::RetryableFailure(RetryReason::TransientUpstreamError)
        );
        assert!(forwarded.response.is_none());
    }
}
