//! Operation Tracker.
//!
//! Registers in-flight requests so the Supervisor's cleanup policy can
//! defer tearing down a child until its tracked operations complete or
//! their per-server timeout elapses.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use uuid::Uuid;

/// Identifies one tracked operation.
pub type OpId = Uuid;

/// `{opID, method, toolName (if method is tool invocation), sessionID, startTime}`.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub op_id: OpId,
    pub method: String,
    pub tool_name: Option<String>,
    pub session_id: String,
    pub start_time: Instant,
}

/// Per-child table of active operations.
#[derive(Default)]
pub struct OperationTracker {
    ops: RwLock<HashMap<OpId, OperationRecord>>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation and return its id.
    pub fn register(&self, method: &str, tool_name: Option<String>, session_id: &str) -> OpId {
        let op_id = Uuid::new_v4();
        let record = OperationRecord {
            op_id,
            method: method.to_string(),
            tool_name,
            session_id: session_id.to_string(),
            start_time: Instant::now(),
        };
        self.ops.write().insert(op_id, record);
        op_id
    }

    /// Remove a completed operation (success, error, or cancellation alike).
    pub fn complete(&self, op_id: OpId) {
        self.ops.write().remove(&op_id);
    }

    /// True iff the tracker holds at least one in-flight operation.
    pub fn has_active_operations(&self) -> bool {
        !self.ops.read().is_empty()
    }

    /// Operations that have exceeded `timeout` since they started, letting
    /// a stale-sweep caller force teardown once the per-server operation
    /// timeout (default 300s) elapses.
    pub fn expired(&self, timeout: Duration) -> Vec<OperationRecord> {
        let now = Instant::now();
        self.ops
            .read()
            .values()
            .filter(|r| now.duration_since(r.start_time) >= timeout)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.ops.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tracker_has_no_active_operations() {
        let t = OperationTracker::new();
        assert!(!t.has_active_operations());
    }

    #[test]
    fn register_then_complete_clears_the_record() {
        let t = OperationTracker::new();
        let id = t.register("tools/call", Some("search".into()), "sess-1");
        assert!(t.has_active_operations());
        assert_eq!(t.active_count(), 1);

        t.complete(id);
        assert!(!t.has_active_operations());
    }

    #[test]
    fn expired_reports_only_operations_past_the_timeout() {
        let t = OperationTracker::new();
        t.register("tools/call", None, "sess-1");
        assert!(t.expired(Duration::from_secs(0)).len() == 1);
        assert!(t.expired(Duration::from_secs(3600)).is_empty());
    }
}
