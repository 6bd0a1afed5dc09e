//! Session Registry.
//!
//! Owns per-client state carried across a streaming event channel and its
//! paired posting endpoint: the initialization flag, negotiated
//! capabilities, a bounded table of pending request ids, and the
//! last-activity timestamp used by the stale sweeper.

use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

/// Upper bound on how many pending request ids a single session tracks
/// before the oldest entries are evicted.
const MAX_PENDING_REQUESTS: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: String,
    pub server_name: String,
    pub initialized: bool,
    pub protocol_version: Option<String>,
    pub capabilities: Option<Value>,
    pending_requests: Vec<(Value, Instant)>,
    pub last_activity_at: Instant,
}

impl SessionState {
    fn new(id: String, server_name: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            server_name,
            initialized: false,
            protocol_version: None,
            capabilities: None,
            pending_requests: Vec::new(),
            last_activity_at: now,
        }
    }
}

/// Thread-safe table of sessions, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh high-entropy session id.
    pub fn new_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Register a new session bound to `server_name`. Idempotent: an
    /// existing id is left untouched rather than reset, so a reconnect
    /// with a client-supplied id doesn't lose state.
    pub fn register(&self, id: &str, server_name: &str) {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| SessionState::new(id.to_string(), server_name.to_string()));
    }

    /// Mark the session initialized and capture the child's advertised
    /// capabilities/protocol version. This happens immediately on a
    /// successful initialize reply; a later
    /// "initialized" notification is accepted but not required.
    pub fn mark_initialized(&self, id: &str, protocol_version: String, capabilities: Value) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.initialized = true;
            s.protocol_version = Some(protocol_version);
            s.capabilities = Some(capabilities);
            s.last_activity_at = Instant::now();
        }
    }

    pub fn is_initialized(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .map(|s| s.initialized)
            .unwrap_or(false)
    }

    /// Whether `id` is a known session at all (distinct from initialized).
    pub fn exists(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Record a pending request id, evicting the oldest entry once the
    /// bounded table is full.
    pub fn record_pending(&self, id: &str, request_id: Value) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            if s.pending_requests.len() >= MAX_PENDING_REQUESTS {
                s.pending_requests.remove(0);
            }
            s.pending_requests.push((request_id, Instant::now()));
        }
    }

    pub fn clear_pending(&self, id: &str, request_id: &Value) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.pending_requests.retain(|(rid, _)| rid != request_id);
        }
    }

    pub fn pending_count(&self, id: &str) -> usize {
        self.sessions
            .get(id)
            .map(|s| s.pending_requests.len())
            .unwrap_or(0)
    }

    /// Refresh the last-activity timestamp for the stale sweeper.
    pub fn touch(&self, id: &str) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.last_activity_at = Instant::now();
        }
    }

    pub fn remove(&self, id: &str) -> Option<SessionState> {
        self.sessions.remove(id).map(|(_, v)| v)
    }

    pub fn get(&self, id: &str) -> Option<SessionState> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Ids of every session whose last activity predates `now - stale_after`.
    pub fn stale_ids(&self, stale_after: std::time::Duration) -> Vec<String> {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|s| now.duration_since(s.last_activity_at) >= stale_after)
            .map(|s| s.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_initialize_before_handshake() {
        let reg = SessionRegistry::new();
        reg.register("s1", "echo");
        assert!(!reg.is_initialized("s1"));
    }

    #[test]
    fn initialize_marks_session_ready_immediately() {
        let reg = SessionRegistry::new();
        reg.register("s1", "echo");
        reg.mark_initialized("s1", "2024-11-05".into(), json!({"tools": {}}));
        assert!(reg.is_initialized("s1"));
    }

    #[test]
    fn pending_table_is_bounded() {
        let reg = SessionRegistry::new();
        reg.register("s1", "echo");
        for i in 0..(MAX_PENDING_REQUESTS + 10) {
            reg.record_pending("s1", json!(i));
        }
        assert!(reg.pending_count("s1") <= MAX_PENDING_REQUESTS);
    }

    #[test]
    fn remove_drops_the_session() {
        let reg = SessionRegistry::new();
        reg.register("s1", "echo");
        assert!(reg.exists("s1"));
        reg.remove("s1");
        assert!(!reg.exists("s1"));
    }
}
