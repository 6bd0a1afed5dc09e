//! Bearer token extraction.
//!
//! The token comparison itself is a pluggable collaborator behind the
//! [`TokenValidator`] trait, so a deployment can swap in a different
//! validation strategy without touching the request-handling path.

use axum::http::HeaderMap;
use mcpbridge_core::error::BridgeError;

pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Accepts exactly one statically configured token. `None` disables
/// authentication entirely (every token, including none at all, passes).
pub struct StaticTokenValidator {
    expected: Option<String>,
}

impl StaticTokenValidator {
    pub fn new(expected: Option<String>) -> Self {
        Self { expected }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> bool {
        match &self.expected {
            Some(expected) => expected == token,
            None => true,
        }
    }
}

/// Extract and validate the `Authorization: Bearer <token>` header.
/// Missing or malformed headers and a failed validator both fail with
/// `Unauthorized`, which the HTTP layer maps to 401 plus a
/// `WWW-Authenticate: Bearer` challenge.
pub fn require_bearer(headers: &HeaderMap, validator: &dyn TokenValidator) -> Result<(), BridgeError> {
    let Some(raw) = headers.get(axum::http::header::AUTHORIZATION) else {
        if validator.validate("") {
            return Ok(());
        }
        return Err(BridgeError::Unauthorized("missing Authorization header".into()));
    };
    let raw = raw
        .to_str()
        .map_err(|_| BridgeError::Unauthorized("Authorization header is not valid UTF-8".into()))?;
    let token = raw
        .strip_prefix("Bearer ")
        .ok_or_else(|| BridgeError::Unauthorized("Authorization header is not a Bearer token".into()))?;

    if validator.validate(token) {
        Ok(())
    } else {
        Err(BridgeError::Unauthorized("bearer token rejected".into()))
    }
}
