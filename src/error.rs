//! Error taxonomy for the pool and the gateway boundary.

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::outcome::FailureReason;

/// Errors raised by the credential store and selection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("key '{0}' not found")]
    NotFound(String),

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("no eligible key in pool")]
    NoEligibleKey,
}

impl From<rusqlite::Error> for PoolError {
    fn from(e: rusqlite::Error) -> Self {
        PoolError::StoreUnavailable(e.to_string())
    }
}

/// Terminal result of a gateway call or an administrative operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("no eligible key available")]
    NoEligibleKey,

    #[error("all attempts failed after {attempts} key(s); last failure: {last_reason}")]
    Exhausted {
        attempts: u32,
        last_reason: FailureReason,
    },

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("key '{0}' not found")]
    NotFound(String),

    #[error("request cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// HTTP-equivalent status for an outer facade to render.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoEligibleKey | GatewayError::Exhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
            GatewayError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NoEligibleKey => "no_eligible_key",
            GatewayError::Exhausted { .. } => "exhausted",
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Cancelled { .. } => "cancelled",
            GatewayError::DeadlineExceeded { .. } => "deadline_exceeded",
            GatewayError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn body(&self) -> ErrorBody {
        let (attempts, last_reason) = match self {
            GatewayError::Exhausted { attempts, last_reason } => (Some(*attempts), Some(*last_reason)),
            GatewayError::Cancelled { attempts } | GatewayError::DeadlineExceeded { attempts } => {
                (Some(*attempts), None)
            }
            _ => (None, None),
        };
        ErrorBody {
            code: self.code(),
            status: self.status_code().as_u16(),
            message: self.to_string(),
            attempts,
            last_reason,
        }
    }
}

impl From<PoolError> for GatewayError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NotFound(id) => GatewayError::NotFound(id),
            PoolError::StoreUnavailable(reason) => GatewayError::StoreUnavailable(reason),
            PoolError::NoEligibleKey => GatewayError::NoEligibleKey,
        }
    }
}

/// Serializable error payload.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<FailureReason>,
}
