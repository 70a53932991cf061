//! Gemini Balance daemon.
//!
//! Opens the sealed key database, imports keys from the config file and
//! serves the gateway over a local JSON-RPC socket.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use zeroize::Zeroizing;

use gemini_balance::clock::SystemClock;
use gemini_balance::config::{Config, MASTER_KEY_ENV};
use gemini_balance::server::{self, Server};
use gemini_balance::store::{CredentialStore, SqliteBackend};
use gemini_balance::upstream::GeminiClient;
use gemini_balance::vault::{self, Sealer};
use gemini_balance::{Gateway, GatewayOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    init_tracing(config.server.json_logs);

    info!("🔑 Gemini Balance v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    // ── Master Key ──────────────────────────────────────────────────
    let master = match std::env::var(MASTER_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Zeroizing::new(key),
        _ => vault::load_or_create_master_key(&config.master_key_path())
            .context("Failed to load master key")?,
    };
    let sealer = Sealer::new(master.as_bytes().to_vec());

    // ── Credential Store ────────────────────────────────────────────
    let backend = SqliteBackend::open(&config.db_path(), sealer)
        .context("Failed to open key database")?;
    let store = Arc::new(CredentialStore::open(Box::new(backend)).context("Failed to load keys")?);

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&store),
        Arc::new(
            GeminiClient::new(&config.upstream.base_url, Duration::from_secs(config.upstream.timeout_secs))
                .context("Failed to build upstream client")?,
        ),
        Arc::new(SystemClock),
        GatewayOptions::from_config(&config),
    ));

    for import in &config.keys {
        gateway
            .add_key(import.secret(), import.quota_limit())
            .context("Failed to import key from config")?;
    }

    let summary = gateway.pool_summary().context("Failed to read pool")?;
    if summary.total == 0 {
        info!("📦 Pool is empty; add keys under `keys:` in the config or via gb.admin.addKey");
    } else {
        server::log_pulse(&summary);
    }

    // ── JSON-RPC Server ─────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                shutdown.cancel();
            }
        });
    }

    let srv = Server::new(
        config.socket_path(),
        gateway,
        Duration::from_secs(config.server.pulse_interval_secs),
    );
    srv.run(shutdown).await
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gemini_balance=info".into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
