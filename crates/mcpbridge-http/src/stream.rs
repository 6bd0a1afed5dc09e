//! The Stream Writer: one writer per SSE connection, first emitting an
//! `endpoint` event naming the paired POST path, then forwarding
//! whatever the outbox delivers as `message` events, with a keep-alive
//! comment every 30 seconds when nothing else is flowing.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream;
use mcpbridge_core::SessionRegistry;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use crate::auth::require_bearer;
use crate::error::HttpError;
use crate::routing::server_name_from_host;
use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_HEADER: &str = "Mcp-Session-Id";

pub async fn sse_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    require_bearer(&headers, state.validator.as_ref()).map_err(HttpError::from)?;

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let server_name = server_name_from_host(host, &state.config)
        .ok_or_else(|| HttpError::from(mcpbridge_core::BridgeError::UnknownServer(host.to_string())))?
        .to_string();

    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(SessionRegistry::new_session_id);

    state.sessions.register(&session_id, &server_name);
    state
        .connections
        .register(&session_id, &server_name)
        .map_err(HttpError::from)?;
    let rx = state.outbox.register(&session_id);

    info!("sse connection opened: session={session_id} server={server_name}");

    let endpoint_uri = format!(
        "https://{server_name}.{}.{}/sessions/{session_id}",
        state.config.subdomain_prefix, state.config.domain
    );
    let endpoint_data = json!({ "uri": endpoint_uri }).to_string();
    let guard = SessionGuard {
        state: state.clone(),
        session_id: session_id.clone(),
        server_name,
    };

    let stream = stream::unfold(
        FramerState::Endpoint(endpoint_data, rx, guard),
        move |framer| async move {
            match framer {
                FramerState::Endpoint(data, rx, guard) => {
                    let event = Event::default().event("endpoint").data(data);
                    Some((Ok::<Event, Infallible>(event), FramerState::Frames(rx, guard)))
                }
                FramerState::Frames(mut rx, guard) => {
                    let frame = rx.recv().await?;
                    let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
                    let event = Event::default().event("message").data(data);
                    Some((Ok::<Event, Infallible>(event), FramerState::Frames(rx, guard)))
                }
            }
        },
    );

    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL));
    let mut response = sse.into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

enum FramerState {
    Endpoint(String, mpsc::Receiver<mcpbridge_core::translator::RemoteFrame>, SessionGuard),
    Frames(mpsc::Receiver<mcpbridge_core::translator::RemoteFrame>, SessionGuard),
}

/// Tears the connection's bookkeeping down when the stream is dropped,
/// whether that's a clean client disconnect or axum cancelling the
/// future. Session-scoped children are stopped and their working
/// directory removed so nothing outlives the connection that owned it.
struct SessionGuard {
    state: AppState,
    session_id: String,
    server_name: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        info!("sse connection closed: session={}", self.session_id);
        self.state.connections.remove(&self.session_id);
        self.state.outbox.remove(&self.session_id);
        self.state.sessions.remove(&self.session_id);

        let session_scoped = self
            .state
            .config
            .servers
            .get(&self.server_name)
            .map(|c| c.session_scoped)
            .unwrap_or(false);
        if session_scoped {
            let supervisor = self.state.supervisor.clone();
            let key = mcpbridge_core::ChildKey::session_scoped(&self.server_name, &self.session_id);
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                let _ = supervisor.stop(&key).await;
                supervisor.cleanup_session_dir(&session_id);
            });
        }
    }
}
