//! Error types for the bridge core.
//!
//! Mirrors the error-kind taxonomy the bridge must preserve end to end:
//! parse, invalid request, method-not-found, timeout, communication,
//! restart, cap-exceeded, unknown-server and unauthorized all surface as
//! distinct variants rather than opaque strings, so the HTTP surface and
//! the JSON-RPC translator can map each one to the correct wire shape.

use thiserror::Error;

/// Result type used throughout the core crate.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Failure categories a supervised child, the serializer, or the session
/// layer can produce.
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// Malformed inbound JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// Well-formed but semantically invalid request (e.g. post before initialize).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The child answered with JSON-RPC method-not-found and the translator
    /// has no fallback for this method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Request deadline elapsed before a response arrived.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Pipe write/read failure against a child.
    #[error("communication error: {0}")]
    Communication(String),

    /// The ticket was in flight when its child was restarted.
    #[error("restarted: {0}")]
    Restarted(String),

    /// A resource cap (connections, queue depth) was exceeded.
    #[error("capacity exceeded: {0}")]
    CapExceeded(String),

    /// The subdomain names a server that isn't configured.
    #[error("unknown server: {0}")]
    UnknownServer(String),

    /// Missing or malformed bearer token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Spawn or configuration failure local to a single child.
    #[error("supervisor error: {0}")]
    Supervisor(String),

    /// Serialization/deserialization failure against serde_json.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

impl BridgeError {
    /// The JSON-RPC 2.0 error code this kind should surface as.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            BridgeError::Parse(_) => -32700,
            BridgeError::InvalidRequest(_) => -32600,
            BridgeError::MethodNotFound(_) => -32601,
            BridgeError::Timeout(_)
            | BridgeError::Communication(_)
            | BridgeError::Restarted(_)
            | BridgeError::Supervisor(_)
            | BridgeError::Serialization(_) => -32603,
            BridgeError::CapExceeded(_) => -32000,
            BridgeError::UnknownServer(_) => -32001,
            BridgeError::Unauthorized(_) => -32002,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_internal_error_code() {
        let e = BridgeError::Timeout("deadline exceeded".into());
        assert_eq!(e.json_rpc_code(), -32603);
        assert!(e.to_string().contains("timeout"));
    }

    #[test]
    fn method_not_found_preserved_verbatim() {
        let e = BridgeError::MethodNotFound("prompts/list".into());
        assert_eq!(e.json_rpc_code(), -32601);
    }
}
