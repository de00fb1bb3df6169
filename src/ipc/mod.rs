pub mod handlers;

use crate::events::Event;
use crate::node::reconciler::NodeError;
use crate::node::ApiError;
use crate::publish::PublishError;
use crate::registry::RegistryError;
use crate::store::GcError;
use crate::AppContext;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

// ─── Error codes — shared contract with IPC clients ──────────────────────────
//
// notFound             = -32001  (planet or article)
// publishInProgress    = -32002
// namingConflict       = -32003  (stale sequence — refresh and retry)
// nodeOffline          = -32004
// nodeAlreadyRunning   = -32005
// unresolvedAttachment = -32006

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const NOT_FOUND: i32 = -32001;
const PUBLISH_IN_PROGRESS: i32 = -32002;
const NAMING_CONFLICT: i32 = -32003;
const NODE_OFFLINE: i32 = -32004;
const NODE_ALREADY_RUNNING: i32 = -32005;
const UNRESOLVED_ATTACHMENT: i32 = -32006;

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "IPC server listening (WebSocket + HTTP health on same port)");

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping node and IPC server");
                if let Err(e) = ctx.reconciler.shutdown().await {
                    warn!(err = %e, "node shutdown during daemon exit failed");
                }
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("IPC server stopped");
    Ok(())
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
///
/// The daemon shares its port for both WebSocket (JSON-RPC) and a plain HTTP
/// health endpoint so clients can check liveness without a WS library.
async fn handle_health_check(mut stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request (we don't inspect it — any GET /health is fine).
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let node = ctx.broadcaster.current_node_state();
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "nodeOnline": node.online,
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Peek at the first bytes to distinguish HTTP health checks from WebSocket
    // upgrades — both share the same port. All GETs other than /health fall
    // through to the WS handshake.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_check(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    // Catch-up: the client gets the current node state immediately instead of
    // waiting for the next transition.
    let (current, mut events) = ctx.broadcaster.subscribe();
    sink.send(Message::Text(notification(
        "node.stateChanged",
        serde_json::to_value(&current)?,
    )))
    .await?;

    loop {
        tokio::select! {
            // Incoming message from client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = dispatch_text(&text, &ctx).await;
                        if let Err(e) = sink.send(Message::Text(response)).await {
                            warn!(err = %e, "send error");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            // Outgoing event
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(text) = event_notification(&event) {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                warn!(err = %e, "event send error");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event stream lagged — resending current snapshots");
                        for text in lag_catch_up(&ctx).await {
                            let _ = sink.send(Message::Text(text)).await;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Notifications to replay after a subscriber lagged. Dropped events are full
/// snapshots, so the newest node state plus the current planet list bring the
/// client fully current again.
async fn lag_catch_up(ctx: &AppContext) -> Vec<String> {
    let mut frames = Vec::with_capacity(2);
    if let Ok(params) = serde_json::to_value(ctx.broadcaster.current_node_state()) {
        frames.push(notification("node.stateChanged", params));
    }
    let planets = ctx.registry.planets().await;
    frames.push(notification("planet.stateChanged", json!({ "planets": planets })));
    frames
}

fn notification(method: &str, params: Value) -> String {
    json!({ "jsonrpc": "2.0", "method": method, "params": params }).to_string()
}

fn event_notification(event: &Event) -> Option<String> {
    let (method, params) = match event {
        Event::NodeStateChanged(state) => {
            ("node.stateChanged", serde_json::to_value(state).ok()?)
        }
        Event::PlanetsChanged(planets) => ("planet.stateChanged", json!({ "planets": planets })),
        Event::PublishProgress { planet_id, stage } => {
            ("planet.publishProgress", json!({ "planetId": planet_id, "stage": stage }))
        }
    };
    Some(notification(method, params))
}

pub async fn dispatch_text(text: &str, ctx: &AppContext) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            return error_response(Value::Null, PARSE_ERROR, "Parse error");
        }
    };

    if req.jsonrpc != "2.0" {
        return error_response(req.id.unwrap_or(Value::Null), INVALID_REQUEST, "Invalid Request");
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    debug!(method = %req.method, "rpc dispatch");

    match dispatch(&req.method, params, ctx).await {
        Ok(value) => {
            let resp = RpcResponse { jsonrpc: "2.0", id, result: Some(value), error: None };
            serde_json::to_string(&resp).unwrap_or_default()
        }
        Err(e) => {
            let (code, msg) = classify_error(&e);
            error_response(id, code, &msg)
        }
    }
}

async fn dispatch(method: &str, params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    match method {
        "daemon.ping" => handlers::daemon::ping(params, ctx).await,
        "daemon.status" => handlers::daemon::status(params, ctx).await,
        "node.launch" => handlers::node::launch(params, ctx).await,
        "node.shutdown" => handlers::node::shutdown(params, ctx).await,
        "node.getState" => handlers::node::get_state(params, ctx).await,
        "node.gc" => handlers::node::gc(params, ctx).await,
        "planet.create" => handlers::planet::create(params, ctx).await,
        "planet.update" => handlers::planet::update(params, ctx).await,
        "planet.list" => handlers::planet::list(params, ctx).await,
        "planet.delete" => handlers::planet::delete(params, ctx).await,
        "planet.publish" => handlers::planet::publish(params, ctx).await,
        "article.create" => handlers::article::create(params, ctx).await,
        "article.update" => handlers::article::update(params, ctx).await,
        "article.delete" => handlers::article::delete(params, ctx).await,
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{}", method)),
    }
}

fn classify_error(e: &anyhow::Error) -> (i32, String) {
    if let Some(err) = e.downcast_ref::<PublishError>() {
        let code = match err {
            PublishError::PlanetNotFound(_) => NOT_FOUND,
            PublishError::InProgress(_) => PUBLISH_IN_PROGRESS,
            PublishError::NamingConflict { .. } => NAMING_CONFLICT,
            PublishError::DaemonOffline => NODE_OFFLINE,
            PublishError::UnresolvedAttachment { .. } => UNRESOLVED_ATTACHMENT,
            PublishError::Api(_) | PublishError::Registry(_) => INTERNAL_ERROR,
        };
        return (code, err.to_string());
    }
    if let Some(err) = e.downcast_ref::<RegistryError>() {
        let code = match err {
            RegistryError::PlanetNotFound(_) | RegistryError::ArticleNotFound(_) => NOT_FOUND,
            _ => INTERNAL_ERROR,
        };
        return (code, err.to_string());
    }
    if let Some(err) = e.downcast_ref::<NodeError>() {
        let code = match err {
            NodeError::AlreadyRunning => NODE_ALREADY_RUNNING,
            _ => INTERNAL_ERROR,
        };
        return (code, err.to_string());
    }
    if let Some(err) = e.downcast_ref::<GcError>() {
        let code = match err {
            GcError::Offline => NODE_OFFLINE,
            _ => INTERNAL_ERROR,
        };
        return (code, err.to_string());
    }
    if let Some(err) = e.downcast_ref::<ApiError>() {
        let code = match err {
            ApiError::Offline => NODE_OFFLINE,
            ApiError::NotFound(_) => NOT_FOUND,
            _ => INTERNAL_ERROR,
        };
        return (code, err.to_string());
    }

    let msg = e.to_string();
    if msg.starts_with("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, "Method not found".to_string());
    }
    if msg.contains("missing field") || msg.contains("invalid type") {
        return (INVALID_PARAMS, format!("Invalid params: {}", msg));
    }
    error!(err = %e, "internal error");
    (INTERNAL_ERROR, "Internal error".to_string())
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError { code, message: message.to_string() }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::node::memory::MemoryNode;
    use tempfile::TempDir;

    fn test_ctx(dir: &TempDir) -> Arc<AppContext> {
        let config = DaemonConfig::new(
            None,
            Some(dir.path().to_path_buf()),
            Some("error".to_string()),
            None,
            None,
        );
        AppContext::build(config, Arc::new(MemoryNode::new()), None).unwrap()
    }

    #[tokio::test]
    async fn lag_catch_up_replays_both_snapshot_kinds() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        ctx.registry.create_planet("Lagged", "", "Plain").await.unwrap();

        let frames: Vec<Value> = lag_catch_up(&ctx)
            .await
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["method"], "node.stateChanged");
        assert_eq!(frames[1]["method"], "planet.stateChanged");
        assert_eq!(frames[1]["params"]["planets"][0]["name"], "Lagged");
    }
}
