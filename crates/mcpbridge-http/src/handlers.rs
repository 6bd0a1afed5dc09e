//! The paired POST endpoint and the health/introspection routes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mcpbridge_core::child::{Child, ChildKey};
use mcpbridge_core::error::BridgeError;
use mcpbridge_core::serializer::deadline_in;
use mcpbridge_core::translator::{
    allows_discovery_fallback, discovery_fallback_result, error_frame, local_to_remote,
    parse_remote_frame, remote_to_local, request_deadline_ms, JsonRpcFrame,
};
use mcpbridge_core::ServerConfig;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::auth::require_bearer;
use crate::error::HttpError;
use crate::routing::server_name_from_host;
use crate::state::AppState;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

fn host_server_name<'a>(headers: &'a HeaderMap, state: &'a AppState) -> Result<&'a str, HttpError> {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    server_name_from_host(host, &state.config)
        .ok_or_else(|| HttpError::from(BridgeError::UnknownServer(host.to_string())))
}

/// `POST /sessions/{id}`: accepts one JSON-RPC-shaped request, dispatches
/// it to the session's child, and answers 202 immediately — the actual
/// response is delivered over the session's SSE stream.
pub async fn post_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    require_bearer(&headers, state.validator.as_ref())?;
    let server_name = host_server_name(&headers, &state)?.to_string();

    if !state.sessions.exists(&session_id) {
        return Err(HttpError::from(BridgeError::InvalidRequest(
            "unknown session id".into(),
        )));
    }

    let frame = parse_remote_frame(&body)?;
    let method = frame.method.clone().unwrap_or_default();

    if method != "initialize" && !state.sessions.is_initialized(&session_id) {
        return Err(HttpError::from(BridgeError::InvalidRequest(
            "session has not completed initialize".into(),
        )));
    }

    let server_config = state
        .config
        .servers
        .get(&server_name)
        .cloned()
        .ok_or_else(|| HttpError::from(BridgeError::UnknownServer(server_name.clone())))?;

    let child = match get_or_start_child(&state, &server_name, &session_id, &server_config).await {
        Ok(child) => child,
        Err(e) => return Err(HttpError::from(e)),
    };

    let local_frame = remote_to_local(&frame, &server_name);
    let tool_name = local_frame
        .params
        .as_ref()
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let op_id = child
        .operations
        .register(&method, tool_name, &session_id);

    let payload = serde_json::to_vec(&local_frame).map_err(BridgeError::from)?;
    let deadline_ms = request_deadline_ms(&method, state.config.operation_timeout.as_millis() as u64);
    let deadline = deadline_in(deadline_ms);
    // Race the request against the connection's own cancellation token so
    // a stale-sweep reap or client disconnect fails this ticket promptly
    // instead of leaving it to run out its deadline.
    let cancel = state
        .connections
        .cancel_token(&session_id)
        .unwrap_or_else(CancellationToken::new);
    let outcome = child
        .serializer()
        .send_and_receive(payload, deadline, cancel)
        .await;
    child.operations.complete(op_id);

    let remote_response = match outcome {
        Ok(bytes) => {
            let local_reply: JsonRpcFrame = serde_json::from_slice(&bytes).map_err(BridgeError::from)?;
            if method == "initialize" {
                if let Some(result) = &local_reply.result {
                    let protocol_version = result
                        .get("protocolVersion")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let capabilities = result.get("capabilities").cloned().unwrap_or(json!({}));
                    state
                        .sessions
                        .mark_initialized(&session_id, protocol_version, capabilities);
                }
            }
            local_to_remote(&local_reply, Some(&method))
        }
        Err(BridgeError::MethodNotFound(_)) if allows_discovery_fallback(&method) => {
            mcpbridge_core::translator::RemoteFrame {
                frame_type: Some("response".to_string()),
                id: frame.id.clone(),
                method: None,
                params: None,
                result: Some(discovery_fallback_result(&method)),
                error: None,
            }
        }
        Err(e) => error_frame(frame.id.clone(), &e),
    };

    state.sessions.touch(&session_id);

    // The initialize handshake answers inline on the HTTP response; every
    // other method is acknowledged here and delivered over the session's
    // SSE stream instead.
    if method == "initialize" {
        let mut response = Json(json!({
            "jsonrpc": "2.0",
            "id": remote_response.id,
            "result": remote_response.result,
            "error": remote_response.error,
        }))
        .into_response();
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
        return Ok(response);
    }

    if !state.outbox.send(&session_id, remote_response).await {
        warn!("no open stream for session {session_id}; response dropped");
    }

    Ok(StatusCode::ACCEPTED.into_response())
}

async fn get_or_start_child(
    state: &AppState,
    server_name: &str,
    session_id: &str,
    config: &ServerConfig,
) -> Result<Arc<Child>, BridgeError> {
    let key = if config.session_scoped {
        ChildKey::session_scoped(server_name, session_id)
    } else {
        ChildKey::global(server_name)
    };
    if let Some(child) = state.supervisor.get(&key) {
        return Ok(child);
    }
    if config.session_scoped {
        state
            .supervisor
            .start_for_session(session_id, server_name, config.clone())
            .await
    } else {
        state.supervisor.start(server_name, config.clone()).await
    }
}

/// `GET /health`: overall liveness, independent of any one child.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "active_connections": state.connections.active_count(),
        "max_connections": state.config.max_connections,
    }))
}

/// `GET /health/servers`: per-server probe history from the Health Checker.
pub async fn health_servers(State(state): State<AppState>) -> Json<Value> {
    let records: HashMap<String, Value> = state
        .health
        .all_records()
        .into_iter()
        .map(|(name, r)| {
            let status = match r.status {
                mcpbridge_core::health::HealthStatus::Healthy => "healthy",
                mcpbridge_core::health::HealthStatus::Unhealthy => "unhealthy",
                mcpbridge_core::health::HealthStatus::Unknown => "unknown",
            };
            (
                name,
                json!({
                    "status": status,
                    "consecutive_failures": r.consecutive_failures,
                    "restart_count": r.restart_count,
                    "last_response_time_ms": r.last_response_time.map(|d| d.as_millis()),
                }),
            )
        })
        .collect();
    Json(json!({ "servers": records }))
}

/// `GET /health/resources`: active connection and per-child operation counts.
pub async fn health_resources(State(state): State<AppState>) -> Json<Value> {
    let mut per_child = HashMap::new();
    for key in state.supervisor.keys() {
        if let Some(child) = state.supervisor.get(&key) {
            per_child.insert(key.to_string(), child.operations.active_count());
        }
    }
    Json(json!({
        "active_connections": state.connections.active_count(),
        "active_operations_by_child": per_child,
    }))
}

/// `GET /listmcp`: the configured server names.
pub async fn list_mcp(State(state): State<AppState>) -> Json<Value> {
    let names: Vec<&String> = state.config.servers.keys().collect();
    Json(json!({ "servers": names }))
}

/// `GET /listtools/{server}`: the normalized tool list for one server,
/// starting its global child on demand.
pub async fn list_tools(
    State(state): State<AppState>,
    Path(server_name): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let config = state
        .config
        .servers
        .get(&server_name)
        .cloned()
        .ok_or_else(|| HttpError::from(BridgeError::UnknownServer(server_name.clone())))?;

    let key = ChildKey::global(&server_name);
    let child = match state.supervisor.get(&key) {
        Some(child) => child,
        None => state
            .supervisor
            .start(&server_name, config)
            .await
            .map_err(HttpError::from)?,
    };

    let request = json!({ "jsonrpc": "2.0", "id": "listtools", "method": "tools/list" })
        .to_string()
        .into_bytes();
    let deadline = deadline_in(request_deadline_ms(
        "tools/list",
        state.config.operation_timeout.as_millis() as u64,
    ));
    let bytes = child
        .serializer()
        .send_and_receive(request, deadline, CancellationToken::new())
        .await
        .map_err(HttpError::from)?;
    let reply: JsonRpcFrame = serde_json::from_slice(&bytes)
        .map_err(BridgeError::from)
        .map_err(HttpError::from)?;
    let remote = local_to_remote(&reply, Some("tools/list"));
    Ok(Json(remote.result.unwrap_or(json!({ "tools": [] }))))
}

/// `POST /cleanup`: force-reap connections past the staleness threshold.
pub async fn cleanup(State(state): State<AppState>) -> Json<Value> {
    let reaped = state
        .connections
        .force_cleanup_older_than(mcpbridge_core::connection::STALE_THRESHOLD);
    Json(json!({ "reaped": reaped }))
}
