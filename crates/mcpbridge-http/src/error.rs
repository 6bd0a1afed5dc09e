//! HTTP-layer error mapping.
//!
//! Every `BridgeError` kind maps to exactly one HTTP status here, so the
//! status-code table lives in one place rather than being re-derived at
//! each handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mcpbridge_core::error::BridgeError;
use serde_json::json;

pub struct HttpError(pub BridgeError);

impl From<BridgeError> for HttpError {
    fn from(e: BridgeError) -> Self {
        HttpError(e)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::Parse(_) => StatusCode::BAD_REQUEST,
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::MethodNotFound(_) => StatusCode::OK, // surfaced as a JSON-RPC error body
            BridgeError::Timeout(_) | BridgeError::Communication(_) | BridgeError::Restarted(_)
            | BridgeError::Supervisor(_) | BridgeError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            BridgeError::CapExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::UnknownServer(_) => StatusCode::NOT_FOUND,
            BridgeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        };

        let body = Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": self.0.json_rpc_code(),
                "message": self.0.to_string(),
            }
        }));

        if status == StatusCode::UNAUTHORIZED {
            (status, [("WWW-Authenticate", "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
