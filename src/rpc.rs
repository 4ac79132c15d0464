//! JSON-RPC 2.0 protocol server over HTTP, plus the SSE event endpoint.
//!
//! `POST /rpc` carries the JSON-RPC envelope (`tools/list`, `tools/call`);
//! `GET /events` streams broadcast events; `GET /health` is liveness. Every
//! RPC response echoes the request id (or null) and malformed input never
//! produces a 5xx.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as FrameEvent, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::AuthState;
use crate::registry::ToolRegistry;
use crate::sse::{Broadcaster, Event};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppContext {
    pub registry: Arc<ToolRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub call_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

pub fn build_router(ctx: AppContext, auth: Arc<AuthState>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc_post).fallback(handle_rpc_wrong_method))
        .route("/events", get(handle_events))
        .layer(axum::middleware::from_fn_with_state(auth, crate::auth::require_auth))
        .route("/health", get(handle_health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// JSON-RPC dispatch
// ---------------------------------------------------------------------------

fn rpc_error(id: serde_json::Value, code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

fn rpc_result(id: serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Dispatch one parsed JSON-RPC envelope. Pure over the registry so tests
/// can call it without a socket.
pub async fn dispatch(ctx: &AppContext, msg: &serde_json::Value) -> serde_json::Value {
    let id = msg.get("id").cloned().unwrap_or(serde_json::Value::Null);

    if msg["jsonrpc"].as_str() != Some("2.0") {
        return rpc_error(id, -32600, "Invalid Request: jsonrpc must be \"2.0\"");
    }
    let Some(method) = msg["method"].as_str() else {
        return rpc_error(id, -32600, "Invalid Request: method missing");
    };

    match method {
        "tools/list" => {
            let tools: Vec<serde_json::Value> = ctx
                .registry
                .list()
                .into_iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.exported_name,
                        "description": t.description,
                        "inputSchema": t.input_schema,
                    })
                })
                .collect();
            rpc_result(id, serde_json::json!({ "tools": tools }))
        }
        "tools/call" => {
            let Some(name) = msg["params"]["name"].as_str() else {
                return rpc_error(id, -32602, "Invalid params: name missing");
            };
            let args = msg["params"]["arguments"].clone();
            // Tool execution outcomes, success or failure, always travel in
            // the result envelope; raw errors are for protocol failures only.
            match ctx.registry.execute(name, args, ctx.call_timeout).await {
                Ok(result) => {
                    let text = match &result {
                        serde_json::Value::String(s) => s.clone(),
                        other => serde_json::to_string(other).unwrap_or_default(),
                    };
                    rpc_result(
                        id,
                        serde_json::json!({
                            "content": [{ "type": "text", "text": text }],
                            "is_error": false,
                        }),
                    )
                }
                Err(e) => {
                    tracing::warn!(tool = name, kind = e.kind(), "tool call failed");
                    rpc_result(
                        id,
                        serde_json::json!({
                            "content": [{ "type": "text", "text": e.to_string() }],
                            "is_error": true,
                        }),
                    )
                }
            }
        }
        _ => rpc_error(id, -32601, "Method not found"),
    }
}

async fn handle_rpc_post(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: String,
) -> Response {
    // Wrong content type is an invalid request, not a transport failure.
    let is_json = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == "application/json")
        .unwrap_or(false);
    if !is_json {
        return json_response(
            StatusCode::BAD_REQUEST,
            &rpc_error(serde_json::Value::Null, -32600, "content type must be application/json"),
        );
    }

    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &rpc_error(serde_json::Value::Null, -32700, "Parse error"),
            );
        }
    };

    let resp = dispatch(&ctx, &parsed).await;
    json_response(StatusCode::OK, &resp)
}

/// Non-POST verbs on the RPC endpoint get a JSON-RPC method_not_found.
async fn handle_rpc_wrong_method() -> Response {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &rpc_error(serde_json::Value::Null, -32601, "use POST"),
    )
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

// ---------------------------------------------------------------------------
// SSE endpoint
// ---------------------------------------------------------------------------

/// Receiver wrapper that unregisters its client when the connection drops.
struct ClientStream {
    id: String,
    broadcaster: Arc<Broadcaster>,
    rx: mpsc::Receiver<Event>,
}

impl Stream for ClientStream {
    type Item = std::result::Result<FrameEvent, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(ev)) => {
                let frame = FrameEvent::default().event(ev.event_type).data(ev.data.to_string());
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.broadcaster.unregister(&self.id);
    }
}

async fn handle_events(
    State(ctx): State<AppContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let filters: Vec<String> = params
        .get("types")
        .map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let id = Uuid::new_v4().to_string();
    let rx = match ctx.broadcaster.register(id.clone(), filters) {
        Ok(rx) => rx,
        Err(e) => {
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &serde_json::json!({ "error": e.to_string() }),
            );
        }
    };

    let stream = ClientStream { id, broadcaster: Arc::clone(&ctx.broadcaster), rx };
    Sse::new(stream).into_response()
}

async fn handle_health(State(ctx): State<AppContext>) -> Response {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "ok",
            "tools": ctx.registry.list().len(),
            "sse_clients": ctx.broadcaster.client_count(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Event bridge: orchestrator feed -> SSE broadcaster
// ---------------------------------------------------------------------------

/// Forward ingest progress events into the SSE fan-out until the feed closes.
pub fn spawn_event_bridge(
    mut rx: tokio::sync::broadcast::Receiver<crate::ingest::IngestEvent>,
    broadcaster: Arc<Broadcaster>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => broadcaster.broadcast(ev.to_sse()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "event bridge lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
