//! Stale-session sweeper.
//!
//! Runs on a fixed cadence, cancelling connections whose session has had
//! no activity for longer than the stale threshold — except when that
//! session's child still reports an active, not-yet-expired operation in
//! the Operation Tracker. Teardown is deferred until the operation
//! completes or the per-server operation timeout elapses (see DESIGN.md),
//! at which point the sweep reaps the session on its next pass and the
//! in-flight ticket sees a `Restarted`-kind error from the child's forced
//! restart.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::child::{ChildKey, Supervisor};
use crate::connection::{ConnectionManager, STALE_THRESHOLD, SWEEP_INTERVAL};
use crate::session::SessionRegistry;

/// Ties the Session Registry's activity clock to the Connection
/// Manager's live connections, deferring to the Operation Tracker before
/// cancelling a connection out from under a long-running tool call.
pub struct StaleSweeper {
    sessions: Arc<SessionRegistry>,
    connections: Arc<ConnectionManager>,
    supervisor: Arc<Supervisor>,
    operation_timeout: Duration,
}

impl StaleSweeper {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        connections: Arc<ConnectionManager>,
        supervisor: Arc<Supervisor>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            connections,
            supervisor,
            operation_timeout,
        }
    }

    /// Run the sweep loop forever, cancellable via `cancel`.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("stale sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep_once();
                }
            }
        }
    }

    /// Run one sweep pass, returning the session ids reaped. Exposed
    /// directly for tests and the `/cleanup` administrative endpoint.
    pub fn sweep_once(&self) -> Vec<String> {
        self.sweep_once_with_threshold(STALE_THRESHOLD)
    }

    /// `sweep_once` parameterized on the staleness threshold, so tests
    /// don't have to wait out the real 120s default.
    pub fn sweep_once_with_threshold(&self, stale_after: Duration) -> Vec<String> {
        let candidates = self.sessions.stale_ids(stale_after);
        let mut reaped = Vec::new();

        for session_id in candidates {
            if self.has_deferring_operation(&session_id) {
                continue;
            }
            self.sessions.remove(&session_id);
            self.connections.remove(&session_id);
            reaped.push(session_id);
        }

        if !reaped.is_empty() {
            info!("stale sweep reaped {} session(s)", reaped.len());
        }
        reaped
    }

    /// True when the session's child has at least one active operation
    /// that has not yet exceeded the per-server operation timeout.
    fn has_deferring_operation(&self, session_id: &str) -> bool {
        let Some(server_name) = self.connections.server_name(session_id) else {
            return false;
        };
        let session_scoped_key = ChildKey::session_scoped(&server_name, session_id);
        let child = self
            .supervisor
            .get(&session_scoped_key)
            .or_else(|| self.supervisor.get(&ChildKey::global(&server_name)));
        let Some(child) = child else {
            return false;
        };

        let active = child.operations.active_count();
        if active == 0 {
            return false;
        }
        child.operations.expired(self.operation_timeout).len() < active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::collections::HashMap;

    fn echo_config() -> ServerConfig {
        ServerConfig {
            command: "cat".into(),
            args: vec![],
            env: HashMap::new(),
            session_scoped: true,
        }
    }

    #[tokio::test]
    async fn reaps_sessions_with_no_active_operations() {
        let sessions = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(10));
        let supervisor = Arc::new(Supervisor::with_default_queue_depth(
            "/tmp/mcpbridge-test-sweeper-1",
        ));

        sessions.register("s1", "echo");
        connections.register("s1", "echo").unwrap();

        let sweeper = StaleSweeper::new(
            sessions.clone(),
            connections.clone(),
            supervisor,
            Duration::from_secs(300),
        );
        // stale_ids() with a zero threshold treats every session as stale.
        let reaped = sessions.stale_ids(Duration::from_secs(0));
        assert_eq!(reaped, vec!["s1".to_string()]);

        let swept = sweeper.sweep_once_with_threshold(Duration::from_secs(0));
        assert_eq!(swept, vec!["s1".to_string()]);
        assert!(!sessions.exists("s1"));
        assert!(!connections.contains("s1"));
    }

    #[tokio::test]
    async fn defers_while_the_childs_operation_is_still_within_timeout() {
        let sessions = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(10));
        let supervisor = Arc::new(Supervisor::with_default_queue_depth(
            "/tmp/mcpbridge-test-sweeper-2",
        ));

        sessions.register("s1", "echo");
        connections.register("s1", "echo").unwrap();
        let child = supervisor
            .start_for_session("s1", "echo", echo_config())
            .await
            .unwrap();
        let _op = child.operations.register("tools/call", Some("slow".into()), "s1");

        let sweeper = StaleSweeper::new(
            sessions.clone(),
            connections.clone(),
            supervisor,
            Duration::from_secs(300),
        );
        let swept = sweeper.sweep_once_with_threshold(Duration::from_secs(0));
        assert!(swept.is_empty());
        assert!(sessions.exists("s1"));
    }

    #[tokio::test]
    async fn reaps_once_the_operation_exceeds_its_timeout() {
        let sessions = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(10));
        let supervisor = Arc::new(Supervisor::with_default_queue_depth(
            "/tmp/mcpbridge-test-sweeper-3",
        ));

        sessions.register("s1", "echo");
        connections.register("s1", "echo").unwrap();
        let child = supervisor
            .start_for_session("s1", "echo", echo_config())
            .await
            .unwrap();
        let _op = child.operations.register("tools/call", Some("slow".into()), "s1");

        let sweeper = StaleSweeper::new(sessions.clone(), connections.clone(), supervisor, Duration::from_secs(0));
        let swept = sweeper.sweep_once_with_threshold(Duration::from_secs(0));
        assert_eq!(swept, vec!["s1".to_string()]);
    }
}
