//! Unix socket JSON-RPC control surface.
//!
//! Listens on `<data_dir>/gemini_balance.sock` (0600) for newline-delimited
//! JSON-RPC 2.0 requests. Local only; socket permissions are the access
//! control.
//!
//! A connection whose read half closes cancels its in-flight request: no
//! new upstream attempts are started, and the attempt already running is
//! still recorded.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::gateway::{Gateway, KeyQuery, PoolSummary};
use crate::selection::SelectionStrategy;
use crate::upstream::UpstreamRequest;

/// Bound on a single request line.
const MAX_REQUEST_BYTES: usize = 1_048_576;
const DEFAULT_ATTEMPT_LIMIT: usize = 50;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id },
            Err(e) => Self::error(id, -32603, format!("Internal error: {}", e)),
        }
    }
    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError { code, message, data: None }),
            id,
        }
    }
    fn invalid_params(id: Option<Value>, e: impl std::fmt::Display) -> Self {
        Self::error(id, -32602, format!("Invalid params: {}", e))
    }
    fn gateway_error(id: Option<Value>, e: GatewayError) -> Self {
        let code = match e {
            GatewayError::InvalidRequest(_) => -32602,
            _ => -32000,
        };
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: e.to_string(),
                data: serde_json::to_value(e.body()).ok(),
            }),
            id,
        }
    }
}

fn reply<T: Serialize>(id: Option<Value>, result: Result<T, GatewayError>) -> JsonRpcResponse {
    match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::gateway_error(id, e),
    }
}

// ── Server ──────────────────────────────────────────────────────────

enum Inbound {
    Line(String),
    TooLong,
}

pub struct Server {
    socket_path: PathBuf,
    gateway: Arc<Gateway>,
    pulse_interval: Duration,
}

impl Server {
    pub fn new(socket_path: PathBuf, gateway: Arc<Gateway>, pulse_interval: Duration) -> Self {
        Self { socket_path, gateway, pulse_interval }
    }

    /// Serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "🔌 Gemini Balance listening");

        if !self.pulse_interval.is_zero() {
            spawn_pulse(Arc::clone(&self.gateway), self.pulse_interval, shutdown.clone());
        }

        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let gateway = Arc::clone(&self.gateway);
            let conn_cancel = shutdown.child_token();

            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut lines =
                    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_BYTES));
                let (tx, mut rx) = mpsc::channel::<Inbound>(8);

                // Reader half: a closed socket cancels whatever is in flight.
                let read_cancel = conn_cancel.clone();
                tokio::spawn(async move {
                    let mut skipped = false;
                    loop {
                        let inbound = match lines.next().await {
                            Some(Ok(line)) => Inbound::Line(line),
                            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                                skipped = true;
                                Inbound::TooLong
                            }
                            Some(Err(LinesCodecError::Io(_))) => break,
                            // A decode error ends the stream once; reading resumes after it.
                            None if std::mem::take(&mut skipped) => continue,
                            None => break,
                        };
                        if tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    read_cancel.cancel();
                });

                while let Some(inbound) = rx.recv().await {
                    let response = match inbound {
                        Inbound::Line(line) if line.trim().is_empty() => continue,
                        Inbound::Line(line) => {
                            handle_request(&line, &gateway, conn_cancel.child_token()).await
                        }
                        Inbound::TooLong => JsonRpcResponse::error(
                            None,
                            -32600,
                            format!("Invalid request: line exceeds {} bytes", MAX_REQUEST_BYTES),
                        ),
                    };
                    let resp_json = serde_json::to_string(&response).unwrap_or_default();
                    if writer.write_all(resp_json.as_bytes()).await.is_err() { break; }
                    if writer.write_all(b"\n").await.is_err() { break; }
                }
            });
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("Server stopped");
        Ok(())
    }
}

// ── Health Pulse ────────────────────────────────────────────────────

fn spawn_pulse(gateway: Arc<Gateway>, every: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip the immediate tick (no traffic yet)
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match gateway.pool_summary() {
                Ok(summary) => log_pulse(&summary),
                Err(e) => warn!(error = %e, "Health pulse unavailable"),
            }
        }
    });
}

pub fn log_pulse(summary: &PoolSummary) {
    let (requests, successes, failures) = summary.keys.iter().fold((0, 0, 0), |acc, k| {
        (
            acc.0 + k.last_24h.requests,
            acc.1 + k.last_24h.successes,
            acc.2 + k.last_24h.failures,
        )
    });
    info!(
        keys = summary.total,
        active = summary.active,
        cooling = summary.cooling,
        disabled = summary.disabled,
        strategy = summary.strategy.name(),
        requests_24h = requests,
        successes_24h = successes,
        failures_24h = failures,
        "💓 Health pulse"
    );
}

// ── Request Handling ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AddKeyParams {
    secret: String,
    #[serde(default)]
    quota_limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct KeyIdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SetQuotaParams {
    id: String,
    quota_limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AttemptsParams {
    key_id: Option<String>,
    limit: Option<usize>,
}

/// Deserialize params, treating a missing value as an empty object.
fn params<T: for<'de> Deserialize<'de>>(raw: Option<Value>) -> Result<T, serde_json::Error> {
    serde_json::from_value(match raw {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(v) => v,
    })
}

async fn handle_request(raw: &str, gateway: &Gateway, cancel: CancellationToken) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, -32700, format!("Parse error: {}", e)),
    };
    let id = req.id;

    macro_rules! parse {
        ($ty:ty) => {
            match params::<$ty>(req.params) {
                Ok(p) => p,
                Err(e) => return JsonRpcResponse::invalid_params(id, e),
            }
        };
    }

    match req.method.as_str() {
        "gb.generate" => {
            let request = parse!(UpstreamRequest);
            reply(id, gateway.handle_with_cancel(request, cancel).await)
        }
        "gb.pool" => reply(id, gateway.pool_summary()),
        "gb.keys" => {
            let query = parse!(KeyQuery);
            reply(id, gateway.list_keys(&query))
        }
        "gb.attempts" => {
            let p = parse!(AttemptsParams);
            let limit = p.limit.unwrap_or(DEFAULT_ATTEMPT_LIMIT);
            reply(id, gateway.recent_attempts(p.key_id.as_deref(), limit))
        }
        "gb.admin.addKey" => {
            let p = parse!(AddKeyParams);
            reply(id, gateway.add_key(&p.secret, p.quota_limit))
        }
        "gb.admin.removeKey" => {
            let p = parse!(KeyIdParams);
            reply(id, gateway.remove_key(&p.id).map(|()| serde_json::json!({ "removed": p.id })))
        }
        "gb.admin.resetKey" => {
            let p = parse!(KeyIdParams);
            reply(id, gateway.reset_key(&p.id))
        }
        "gb.admin.resetUsage" => {
            reply(id, gateway.reset_usage().map(|n| serde_json::json!({ "reset": n })))
        }
        "gb.admin.resetFailures" => {
            reply(id, gateway.reset_failures().map(|n| serde_json::json!({ "reset": n })))
        }
        "gb.admin.setQuota" => {
            let p = parse!(SetQuotaParams);
            reply(id, gateway.set_quota(&p.id, p.quota_limit))
        }
        "gb.admin.setStrategy" => {
            let strategy = parse!(SelectionStrategy);
            reply(id, gateway.set_strategy(strategy).map(|()| strategy))
        }
        _ => JsonRpcResponse::error(id, -32601, format!("Unknown method: {}", req.method)),
    }
}
