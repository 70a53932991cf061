//! Upstream client capability — forwards one request under one key.
//!
//! Implementations own the wire format and the classification of the
//! upstream's reply into an [`Outcome`]. The pool never parses upstream
//! payloads itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::Key;
use crate::outcome::Outcome;

pub mod gemini;

pub use gemini::GeminiClient;

// ── Core Types ──────────────────────────────────────────────────────

/// An inbound call to be forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRequest {
    /// Model name without the `models/` prefix, e.g. `gemini-2.0-flash`.
    pub model: String,
    /// Upstream method, e.g. `generateContent`.
    #[serde(default = "default_method")]
    pub method: String,
    /// Request body passed through untouched.
    #[serde(default)]
    pub body: Value,
}

fn default_method() -> String {
    "generateContent".to_string()
}

impl UpstreamRequest {
    pub fn new(model: impl Into<String>, body: Value) -> Self {
        Self {
            model: model.into(),
            method: default_method(),
            body,
        }
    }

    /// Reject names that cannot be placed in a URL path segment.
    pub fn validate(&self) -> Result<(), String> {
        fn path_safe(s: &str) -> bool {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        }
        let model = self.model.strip_prefix("models/").unwrap_or(&self.model);
        if !path_safe(model) {
            return Err(format!("invalid model name '{}'", self.model));
        }
        if !path_safe(&self.method) {
            return Err(format!("invalid method '{}'", self.method));
        }
        Ok(())
    }
}

/// What came back from the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

/// Result of one forwarded call: its classification, plus the reply when
/// one was received.
#[derive(Debug, Clone, PartialEq)]
pub struct Forwarded {
    pub outcome: Outcome,
    pub response: Option<UpstreamResponse>,
}

// ── Client Trait ────────────────────────────────────────────────────

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Forward `request` under `key`. Never fails: transport errors are
    /// reported as a retryable outcome.
    async fn forward(&self, key: &Key, request: &UpstreamRequest) -> Forwarded;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_method() {
        let req: UpstreamRequest =
            serde_json::from_str(r#"{"model":"gemini-2.0-flash","body":{"contents":[]}}"#).unwrap();
        assert_eq!(req.method, "generateContent");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_path_tricks() {
        let mut req = UpstreamRequest::new("models/gemini-1.5-pro", Value::Null);
        assert!(req.validate().is_ok());

        req.model = "../admin".into();
        assert!(req.validate().is_err());
        req.model = "gemini?key=x".into();
        assert!(req.validate().is_err());
        req.model = String::new();
        assert!(req.validate().is_err());

        req.model = "gemini-pro".into();
        req.method = "generateContent/evil".into();
        assert!(req.validate().is_err());
    }
}
