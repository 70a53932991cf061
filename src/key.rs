//! Key model — one upstream credential and its health/quota state.
//!
//! Secret material lives behind [`Secret`], which never prints itself and
//! wipes its buffer when the last handle is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Number of hex characters of the secret's SHA-256 used in a key id.
const ID_HASH_CHARS: usize = 12;

// ── Secret ──────────────────────────────────────────────────────────

/// Opaque credential material. Cheap to clone; zeroized on final drop.
#[derive(Clone)]
pub struct Secret(Arc<Zeroizing<String>>);

impl Secret {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Arc::new(Zeroizing::new(raw.into())))
    }

    /// The raw credential. Only the upstream client and the vault should
    /// ever call this.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Log-safe rendering, e.g. `AIzaSy...cs3w`.
    pub fn redacted(&self) -> String {
        redact(self.expose())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.redacted())
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for Secret {}

/// Redact a credential for display: keep a short prefix and suffix.
pub fn redact(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= 10 {
        let head: String = chars.iter().take(chars.len().min(4)).collect();
        return format!("{}...", head);
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Stable identifier for a secret: `key-` + 12 hex chars of its SHA-256.
pub fn key_id_for(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let hex = hex::encode(digest);
    format!("key-{}", &hex[..ID_HASH_CHARS])
}

// ── Status ──────────────────────────────────────────────────────────

/// Eligibility of a key. `Cooling` always carries its expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Cooling { until: DateTime<Utc> },
    Disabled,
}

impl KeyStatus {
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Cooling { .. } => "cooling",
            KeyStatus::Disabled => "disabled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, KeyStatus::Active)
    }

    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        match self {
            KeyStatus::Cooling { until } => Some(*until),
            _ => None,
        }
    }
}

// ── Key ─────────────────────────────────────────────────────────────

/// One upstream credential.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub id: String,
    pub secret: Secret,
    pub status: KeyStatus,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub quota_used: u64,
    /// `None` means unknown / unbounded.
    pub quota_limit: Option<u64>,
    pub added_at: DateTime<Utc>,
}

impl Key {
    /// A fresh, active key for `secret`.
    pub fn new(secret: Secret, quota_limit: Option<u64>, now: DateTime<Utc>) -> Self {
        Self {
            id: key_id_for(secret.expose()),
            secret,
            status: KeyStatus::Active,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            quota_used: 0,
            quota_limit,
            added_at: now,
        }
    }

    /// True once the known quota limit has been reached.
    pub fn quota_reached(&self) -> bool {
        matches!(self.quota_limit, Some(limit) if self.quota_used >= limit)
    }

    pub fn view(&self) -> KeyView {
        KeyView {
            id: self.id.clone(),
            secret: self.secret.redacted(),
            status: self.status.label(),
            cooldown_until: self.status.cooldown_until(),
            consecutive_failures: self.consecutive_failures,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            quota_used: self.quota_used,
            quota_limit: self.quota_limit,
            added_at: self.added_at,
        }
    }
}

/// Log- and wire-safe projection of a [`Key`].
#[derive(Debug, Clone, Serialize)]
pub struct KeyView {
    pub id: String,
    pub secret: String,
    pub status: &'static str,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub quota_used: u64,
    pub quota_limit: Option<u64>,
    pub added_at: DateTime<Utc>,
}
