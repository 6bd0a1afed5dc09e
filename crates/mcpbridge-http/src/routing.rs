//! Subdomain-based server routing: `<server>.<prefix>.<domain>` selects
//! which configured child a request targets.

use mcpbridge_core::BridgeConfig;

/// Extract the server name from a `Host` header value, validating it
/// against `cfg`'s subdomain prefix and domain and against the set of
/// configured servers. Returns `None` for a malformed or unknown host so
/// the caller can answer 404 without leaking which part failed.
pub fn server_name_from_host<'a>(host: &'a str, cfg: &BridgeConfig) -> Option<&'a str> {
    let host = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{}.{}", cfg.subdomain_prefix, cfg.domain);
    let server = host.strip_suffix(&suffix)?;
    if server.is_empty() || server.contains('.') {
        return None;
    }
    cfg.servers.contains_key(server).then_some(server)
}
