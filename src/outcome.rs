//! Attempt outcomes — the closed set of results one upstream call can have.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a failed attempt may be retried on another key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    RateLimited,
    TransientUpstreamError,
}

/// Why a key must be taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalReason {
    InvalidCredential,
    QuotaExhaustedPermanently,
}

/// Classification of a single upstream exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /// `cost` is the quota the call consumed, when the upstream reports it.
    Success { cost: Option<u64> },
    RetryableFailure(RetryReason),
    FatalFailure(FatalReason),
}

/// The failure half of [`Outcome`], used when summarising a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Retryable(RetryReason),
    Fatal(FatalReason),
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::RetryableFailure(_) => "retryable_failure",
            Outcome::FatalFailure(_) => "fatal_failure",
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match *self {
            Outcome::Success { .. } => None,
            Outcome::RetryableFailure(r) => Some(FailureReason::Retryable(r)),
            Outcome::FatalFailure(r) => Some(FailureReason::Fatal(r)),
        }
    }

    /// Rebuild an outcome from its persisted columns.
    pub fn from_parts(kind: &str, reason: Option<&str>, cost: Option<u64>) -> Option<Self> {
        match (kind, reason) {
            ("success", _) => Some(Outcome::Success { cost }),
            ("retryable_failure", Some("rate_limited")) => {
                Some(Outcome::RetryableFailure(RetryReason::RateLimited))
            }
            ("retryable_failure", Some("transient_upstream_error")) => {
                Some(Outcome::RetryableFailure(RetryReason::TransientUpstreamError))
            }
            ("fatal_failure", Some("invalid_credential")) => {
                Some(Outcome::FatalFailure(FatalReason::InvalidCredential))
            }
            ("fatal_failure", Some("quota_exhausted_permanently")) => {
                Some(Outcome::FatalFailure(FatalReason::QuotaExhaustedPermanently))
            }
            _ => None,
        }
    }
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Retryable(RetryReason::RateLimited) => "rate_limited",
            FailureReason::Retryable(RetryReason::TransientUpstreamError) => "transient_upstream_error",
            FailureReason::Fatal(FatalReason::InvalidCredential) => "invalid_credential",
            FailureReason::Fatal(FatalReason::QuotaExhaustedPermanently) => "quota_exhausted_permanently",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Immutable record of one forwarded call under one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// Ties together every attempt made for one inbound request.
    pub request_id: String,
    pub key_id: String,
    pub at: DateTime<Utc>,
    pub outcome: Outcome,
    #[serde(with = "latency_ms")]
    pub latency: Duration,
}

mod latency_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(latency: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(latency.as_millis() as u64)
    }
}
