//! Bidirectional mapping between the remote client framing and the local
//! JSON-RPC framing spoken by a stdio child, including tool-name
//! canonicalization and server-namespace stripping.
//!
//! The two halves are pure, table-free functions so the involution
//! property (normalize then denormalize is the identity on the same
//! name) holds without any persisted state.

use serde_json::{Map, Value, json};

use crate::error::{BridgeError, BridgeResult};

/// A JSON-RPC 2.0 envelope as spoken on a child's stdio.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JsonRpcFrame {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// The remote client's frame shape: `{type, id, method, params}`, or its
/// JSON-RPC equivalent when a client speaks JSON-RPC directly.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemoteFrame {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub frame_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Methods for which a "method not found" reply from the child may be
/// synthesized into an empty success at the edge.
const DISCOVERY_FALLBACK_METHODS: &[&str] = &[
    "resources/list",
    "prompts/list",
    "resources/templates/list",
];

/// Discovery-style listing methods, including `tools/list` (which has no
/// fallback synthesis but shares the same deadline class).
const DISCOVERY_METHODS: &[&str] = &[
    "tools/list",
    "resources/list",
    "prompts/list",
    "resources/templates/list",
];

const INIT_DEADLINE_MS: u64 = 30_000;
const DISCOVERY_DEADLINE_MS: u64 = 30_000;
const TOOL_CALL_DEADLINE_MS: u64 = 120_000;

/// Default per-request deadline for `method`, distinct from the
/// per-server operation-tracker deferral timeout configured as
/// `operation_timeout`: 30s for initialization, 30s for discovery-style
/// listing, 2 minutes for tool invocation. Anything outside those three
/// classes falls back to `fallback_ms`, the server's configured
/// operation timeout.
pub fn request_deadline_ms(method: &str, fallback_ms: u64) -> u64 {
    match method {
        "initialize" => INIT_DEADLINE_MS,
        "tools/call" => TOOL_CALL_DEADLINE_MS,
        m if DISCOVERY_METHODS.contains(&m) => DISCOVERY_DEADLINE_MS,
        _ => fallback_ms,
    }
}

/// Parse a raw POST body into a `RemoteFrame`, rejecting non-JSON or
/// structurally invalid bodies with a `Parse` error.
pub fn parse_remote_frame(body: &[u8]) -> BridgeResult<RemoteFrame> {
    serde_json::from_slice(body).map_err(|e| BridgeError::Parse(e.to_string()))
}

/// Outbound: remote client frame -> JSON-RPC frame for the child.
///
/// `id` is preserved exactly (numeric vs string round-trips); tool names
/// embedded in `tools/call` params are denormalized (namespace stripped,
/// snake_case mapped back to the child's advertised spelling).
pub fn remote_to_local(frame: &RemoteFrame, server_name: &str) -> JsonRpcFrame {
    let method = frame.method.clone();
    let params = frame.params.clone().map(|p| match &method {
        Some(m) if m == "tools/call" => denormalize_tool_call_params(p, server_name),
        _ => p,
    });

    JsonRpcFrame {
        jsonrpc: "2.0".to_string(),
        id: frame.id.clone(),
        method,
        params,
        result: None,
        error: None,
    }
}

/// Inbound: JSON-RPC frame from the child -> remote client frame.
///
/// `type` is `"response"` when `result` or `error` is present, else
/// `"request"`. Tool-discovery responses have every tool name normalized;
/// `inputSchema` is left byte-identical. `method` is the original method
/// this response answers, threaded in by the caller (the serializer knows
/// the request that produced this reply); it is not itself part of the
/// JSON-RPC frame.
pub fn local_to_remote(frame: &JsonRpcFrame, answered_method: Option<&str>) -> RemoteFrame {
    let is_response = frame.result.is_some() || frame.error.is_some();
    let frame_type = if is_response { "response" } else { "request" };

    let result = frame.result.clone().map(|r| match answered_method {
        Some("tools/list") => normalize_tools_list_result(r),
        _ => r,
    });

    RemoteFrame {
        frame_type: Some(frame_type.to_string()),
        id: frame.id.clone(),
        method: frame.method.clone(),
        params: frame.params.clone(),
        result,
        error: frame.error.clone(),
    }
}

/// True when `method` is a discovery-style method the translator may
/// synthesize an empty-success fallback for on method-not-found.
pub fn allows_discovery_fallback(method: &str) -> bool {
    DISCOVERY_FALLBACK_METHODS.contains(&method)
}

/// The empty-success payload synthesized for a discovery fallback.
pub fn discovery_fallback_result(method: &str) -> Value {
    match method {
        "resources/list" => json!({ "resources": [] }),
        "prompts/list" => json!({ "prompts": [] }),
        "resources/templates/list" => json!({ "resourceTemplates": [] }),
        _ => json!({}),
    }
}

/// Outbound (client -> child): strip a leading `ServerName:` namespace and
/// map `snake_case` back to hyphen form. Deterministic and state-free
/// (see DESIGN.md for why this isn't memoized); lossy for a child that
/// advertised a dotted name, since the inverse of `_` is always `-`.
pub fn denormalize_tool_name(name: &str, server_name: &str) -> String {
    let prefix = format!("{server_name}:");
    let stripped = name.strip_prefix(&prefix).unwrap_or(name);
    stripped.replace('_', "-")
}

/// Inbound (child -> client): hyphens and dots become underscores.
/// Case is preserved; tool-name matching is case-insensitive elsewhere,
/// but storage is not.
pub fn normalize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '-' || c == '.' { '_' } else { c })
        .collect()
}

fn denormalize_tool_call_params(params: Value, server_name: &str) -> Value {
    let Value::Object(mut obj) = params else {
        return params;
    };
    if let Some(Value::String(name)) = obj.get("name").cloned() {
        obj.insert(
            "name".to_string(),
            Value::String(denormalize_tool_name(&name, server_name)),
        );
    }
    Value::Object(obj)
}

fn normalize_tools_list_result(result: Value) -> Value {
    let Value::Object(mut obj) = result else {
        return result;
    };
    let Some(Value::Array(tools)) = obj.get("tools").cloned() else {
        return Value::Object(obj);
    };
    let normalized: Vec<Value> = tools
        .into_iter()
        .map(|t| {
            let Value::Object(mut tool) = t else {
                return t;
            };
            if let Some(Value::String(name)) = tool.get("name").cloned() {
                tool.insert("name".to_string(), Value::String(normalize_tool_name(&name)));
            }
            // inputSchema is passed through untouched, byte-identical.
            Value::Object(tool)
        })
        .collect();
    obj.insert("tools".to_string(), Value::Array(normalized));
    Value::Object(obj)
}

/// Build a translated JSON-RPC error frame for the client, given a
/// `BridgeError`. Used when a ticket fails before the child ever answers.
pub fn error_frame(id: Option<Value>, err: &BridgeError) -> RemoteFrame {
    let mut error_obj = Map::new();
    error_obj.insert("code".to_string(), json!(err.json_rpc_code()));
    error_obj.insert("message".to_string(), json!(err.to_string()));
    RemoteFrame {
        frame_type: Some("response".to_string()),
        id,
        method: None,
        params: None,
        result: None,
        error: Some(Value::Object(error_obj)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_tool_name("create-entities");
        let twice = normalize_tool_name(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "create_entities");
    }

    #[test]
    fn denormalize_strips_namespace_and_restores_separator() {
        let got = denormalize_tool_name("Memory:create_entities", "Memory");
        assert_eq!(got, "create-entities");
    }

    #[test]
    fn normalize_then_denormalize_is_involution() {
        let original = "create-entities";
        let normalized = normalize_tool_name(original);
        let back = denormalize_tool_name(&normalized, "Memory");
        assert_eq!(back, original);
    }

    #[test]
    fn denormalize_is_lossy_for_dotted_names() {
        // Accepted gap, see DESIGN.md: both `-` and `.` normalize to `_`,
        // and the pure inverse always restores `-`.
        let normalized = normalize_tool_name("mcp.read_file");
        let back = denormalize_tool_name(&normalized, "Memory");
        assert_eq!(back, "mcp-read-file");
    }

    proptest::proptest! {
        #[test]
        fn normalize_then_denormalize_is_involution_prop(
            name in "[a-z][a-z0-9]{0,12}(-[a-z0-9]{1,8}){0,3}",
            server in "[A-Z][a-zA-Z0-9]{0,8}",
        ) {
            let normalized = normalize_tool_name(&name);
            let back = denormalize_tool_name(&normalized, &server);
            prop_assert_eq!(back, name);
        }

        #[test]
        fn normalize_is_always_idempotent_prop(name in "[a-zA-Z0-9._-]{0,24}") {
            let once = normalize_tool_name(&name);
            let twice = normalize_tool_name(&once);
            prop_assert_eq!(once, twice);
        }
    }

    #[test]
    fn id_round_trips_numeric_and_string() {
        let numeric = RemoteFrame {
            frame_type: None,
            id: Some(json!(42)),
            method: Some("tools/list".into()),
            params: None,
            result: None,
            error: None,
        };
        let local = remote_to_local(&numeric, "srv");
        assert_eq!(local.id, Some(json!(42)));

        let stringy = RemoteFrame {
            frame_type: None,
            id: Some(json!("abc")),
            method: Some("tools/list".into()),
            params: None,
            result: None,
            error: None,
        };
        let local = remote_to_local(&stringy, "srv");
        assert_eq!(local.id, Some(json!("abc")));
    }

    #[test]
    fn response_type_is_inferred_from_result_or_error() {
        let reply = JsonRpcFrame {
            jsonrpc: "2.0".into(),
            id: Some(json!(1)),
            method: None,
            params: None,
            result: Some(json!({"ok": true})),
            error: None,
        };
        let remote = local_to_remote(&reply, None);
        assert_eq!(remote.frame_type.as_deref(), Some("response"));
    }

    #[test]
    fn request_type_when_no_result_or_error() {
        let notification = JsonRpcFrame {
            jsonrpc: "2.0".into(),
            id: None,
            method: Some("notifications/progress".into()),
            params: Some(json!({})),
            result: None,
            error: None,
        };
        let remote = local_to_remote(&notification, None);
        assert_eq!(remote.frame_type.as_deref(), Some("request"));
    }

    #[test]
    fn tools_list_normalizes_names_and_preserves_schema() {
        let reply = JsonRpcFrame {
            jsonrpc: "2.0".into(),
            id: Some(json!(2)),
            method: None,
            params: None,
            result: Some(json!({
                "tools": [
                    {"name": "create-entities", "inputSchema": {"type": "object", "properties": {}}}
                ]
            })),
            error: None,
        };
        let remote = local_to_remote(&reply, Some("tools/list"));
        let tools = remote.result.unwrap();
        let name = tools["tools"][0]["name"].as_str().unwrap();
        assert_eq!(name, "create_entities");
        assert_eq!(
            tools["tools"][0]["inputSchema"],
            json!({"type": "object", "properties": {}})
        );
    }

    #[test]
    fn discovery_fallback_allowed_only_for_listed_methods() {
        assert!(allows_discovery_fallback("resources/list"));
        assert!(!allows_discovery_fallback("tools/call"));
    }

    #[test]
    fn request_deadline_is_method_specific() {
        assert_eq!(request_deadline_ms("initialize", 300_000), 30_000);
        assert_eq!(request_deadline_ms("tools/list", 300_000), 30_000);
        assert_eq!(request_deadline_ms("resources/list", 300_000), 30_000);
        assert_eq!(request_deadline_ms("tools/call", 300_000), 120_000);
        assert_eq!(request_deadline_ms("notifications/progress", 300_000), 300_000);
    }

    #[test]
    fn parse_rejects_non_json() {
        let err = parse_remote_frame(b"not json").unwrap_err();
        assert!(matches!(err, BridgeError::Parse(_)));
    }
}
