//! Configuration — a YAML file with defaults for every field.
//!
//! Resolution order: explicit path → `GEMINI_BALANCE_CONFIG` →
//! `<data_dir>/config.yaml` → built-in defaults. The data directory is
//! `~/.gemini-balance` unless `GEMINI_BALANCE_DATA_DIR` says otherwise.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::failover::DEFAULT_MAX_ATTEMPTS;
use crate::health::HealthPolicy;
use crate::selection::SelectionStrategy;
use crate::upstream::gemini::DEFAULT_BASE_URL;

pub const CONFIG_ENV: &str = "GEMINI_BALANCE_CONFIG";
pub const DATA_DIR_ENV: &str = "GEMINI_BALANCE_DATA_DIR";
pub const MASTER_KEY_ENV: &str = "GEMINI_BALANCE_MASTER_KEY";

/// Upper bound for any configured duration (ten years).
const MAX_SECS: u64 = 10 * 365 * 86_400;

// ── Sections ────────────────────────────────────────────────────────

/// A key listed in the config file: either the bare secret or a map.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum KeyImport {
    Bare(String),
    Detailed {
        secret: String,
        #[serde(default)]
        quota_limit: Option<u64>,
    },
}

impl KeyImport {
    pub fn secret(&self) -> &str {
        match self {
            KeyImport::Bare(secret) | KeyImport::Detailed { secret, .. } => secret,
        }
    }

    pub fn quota_limit(&self) -> Option<u64> {
        match self {
            KeyImport::Bare(_) => None,
            KeyImport::Detailed { quota_limit, .. } => *quota_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    #[default]
    LeastRecentlyUsed,
    Sticky,
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub strategy: StrategyName,
    /// Per-key usage before `sticky` moves on.
    pub usage_threshold: u64,
    pub seed: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyName::LeastRecentlyUsed,
            usage_threshold: 50,
            seed: 0,
        }
    }
}

impl SelectionConfig {
    pub fn strategy(&self) -> SelectionStrategy {
        match self.strategy {
            StrategyName::LeastRecentlyUsed => SelectionStrategy::LeastRecentlyUsed,
            StrategyName::Sticky => SelectionStrategy::Sticky {
                usage_threshold: self.usage_threshold,
            },
            StrategyName::Random => SelectionStrategy::Random { seed: self.seed },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub max_attempts: u32,
    /// Per-request deadline. No deadline when absent.
    pub request_timeout_secs: Option<u64>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout_secs: None,
        }
    }
}

impl FailoverConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Defaults to `<data_dir>/gemini_balance.sock`.
    pub socket_path: Option<PathBuf>,
    pub pulse_interval_secs: u64,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            pulse_interval_secs: 900,
            json_logs: false,
        }
    }
}

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub keys: Vec<KeyImport>,
    pub health: HealthPolicy,
    pub selection: SelectionConfig,
    pub failover: FailoverConfig,
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Resolve, read and validate the configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let data_dir = data_dir()?;
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| {
                let default = data_dir.join("config.yaml");
                default.exists().then_some(default)
            });

        match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                tracing::info!(path = %path.display(), "Loaded configuration");
                Self::from_yaml(&text, data_dir)
                    .with_context(|| format!("invalid config {}", path.display()))
            }
            None => {
                let config = Self { data_dir, ..Self::default() };
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Parse and validate YAML text. An empty document yields the defaults.
    pub fn from_yaml(text: &str, data_dir: PathBuf) -> Result<Self> {
        let mut config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.data_dir = data_dir;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let h = &self.health;
        if self.failover.max_attempts == 0 {
            anyhow::bail!("failover.max_attempts must be at least 1");
        }
        if self.failover.request_timeout_secs == Some(0) {
            anyhow::bail!("failover.request_timeout_secs must be positive when set");
        }
        if h.transient_failure_threshold == 0 {
            anyhow::bail!("health.transient_failure_threshold must be at least 1");
        }
        for (name, value) in [
            ("health.rate_limit_backoff_base_secs", h.rate_limit_backoff_base_secs),
            ("health.transient_cooldown_secs", h.transient_cooldown_secs),
            ("health.quota_cooldown_secs", h.quota_cooldown_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be positive", name);
            }
        }
        if h.rate_limit_backoff_base_secs > h.rate_limit_backoff_cap_secs {
            anyhow::bail!(
                "health.rate_limit_backoff_base_secs ({}) exceeds rate_limit_backoff_cap_secs ({})",
                h.rate_limit_backoff_base_secs,
                h.rate_limit_backoff_cap_secs
            );
        }
        for (name, value) in [
            ("health.rate_limit_backoff_cap_secs", h.rate_limit_backoff_cap_secs),
            ("health.transient_cooldown_secs", h.transient_cooldown_secs),
            ("health.quota_cooldown_secs", h.quota_cooldown_secs),
        ] {
            if value > MAX_SECS {
                anyhow::bail!("{} is larger than ten years", name);
            }
        }
        if self.selection.usage_threshold == 0 {
            anyhow::bail!("selection.usage_threshold must be at least 1");
        }
        if self.upstream.timeout_secs == 0 {
            anyhow::bail!("upstream.timeout_secs must be positive");
        }
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            anyhow::bail!("upstream.base_url must be an http(s) URL");
        }
        for (i, key) in self.keys.iter().enumerate() {
            if key.secret().trim().is_empty() {
                anyhow::bail!("keys[{}] has an empty secret", i);
            }
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("gemini_balance.db")
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.data_dir.join("master.key")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.server
            .socket_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("gemini_balance.sock"))
    }
}

/// `GEMINI_BALANCE_DATA_DIR`, else `~/.gemini-balance`.
pub fn data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".gemini-balance"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config> {
        Config::from_yaml(text, PathBuf::from("/tmp/gb"))
    }

    #[test]
    fn test_empty_document_is_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.health, HealthPolicy::default());
        assert_eq!(config.failover.max_attempts, 3);
        assert_eq!(config.selection.strategy(), SelectionStrategy::LeastRecentlyUsed);
        assert_eq!(config.upstream.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/gb/gemini_balance.db"));
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/gb/gemini_balance.sock"));
    }

    #[test]
    fn test_full_document() {
        let config = parse(
            r#"
keys:
  - AIzaSyBareBareBareBare
  - secret: AIzaSyDetailedDetailed
    quota_limit: 1500
health:
  transient_failure_threshold: 5
  rate_limit_backoff_cap_secs: 120
selection:
  strategy: sticky
  usage_threshold: 20
failover:
  max_attempts: 4
  request_timeout_secs: 30
server:
  socket_path: /run/gb.sock
  json_logs: true
"#,
        )
        .unwrap();

        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys[0].secret(), "AIzaSyBareBareBareBare");
        assert_eq!(config.keys[0].quota_limit(), None);
        assert_eq!(config.keys[1].quota_limit(), Some(1500));
        assert_eq!(config.health.transient_failure_threshold, 5);
        assert_eq!(config.health.rate_limit_backoff_base_secs, 2);
        assert_eq!(config.health.rate_limit_backoff_cap_secs, 120);
        assert_eq!(
            config.selection.strategy(),
            SelectionStrategy::Sticky { usage_threshold: 20 }
        );
        assert_eq!(config.failover.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.socket_path(), PathBuf::from("/run/gb.sock"));
        assert!(config.server.json_logs);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse("failover:\n  max_attempts: 0\n").is_err());
        assert!(parse("health:\n  rate_limit_backoff_base_secs: 10\n  rate_limit_backoff_cap_secs: 5\n").is_err());
        assert!(parse("selection:\n  strategy: sticky\n  usage_threshold: 0\n").is_err());
        assert!(parse("selection:\n  strategy: round_robin\n").is_err());
        assert!(parse("upstream:\n  base_url: ftp://nope\n").is_err());
        assert!(parse("keys:\n  - \"  \"\n").is_err());
        assert!(parse("health:\n  quota_cooldown_secs: 999999999999\n").is_err());
        assert!(parse("health:\n  rate_limit_backoff_base_secs: 0\n").is_err());
        assert!(parse("health:\n  transient_cooldown_secs: 0\n").is_err());
        assert!(parse("health:\n  quota_cooldown_secs: 0\n").is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gb.yaml");
        std::fs::write(&path, "selection:\n  strategy: random\n  seed: 7\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.selection.strategy(), SelectionStrategy::Random { seed: 7 });

        assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
    }
}
