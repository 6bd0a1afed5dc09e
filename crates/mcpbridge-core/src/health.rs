//! Health Checker.
//!
//! Every 30 seconds, probes each known child with a lightweight method
//! through the Serializer. After three consecutive failures it asks the
//! Supervisor to restart the child, capped at three restarts inside any
//! five-minute window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::child::{ChildKey, Supervisor};
use crate::config::ServerConfig;
use crate::serializer::deadline_in;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const PROBE_DEADLINE_MS: u64 = 10_000;
const FAILURE_THRESHOLD: u32 = 3;
const RESTART_CAP: u32 = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(5 * 60);

/// The probe method issued against each child. Any method the child can
/// answer trivially satisfies the liveness check; `ping` matches the
/// method MCP servers are expected to implement for this purpose.
pub const PROBE_METHOD: &str = "ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub last_check: Option<Instant>,
    pub last_response_time: Option<Duration>,
    pub consecutive_failures: u32,
    pub restart_count: u32,
    restart_window_start: Instant,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: None,
            last_response_time: None,
            consecutive_failures: 0,
            restart_count: 0,
            restart_window_start: Instant::now(),
        }
    }
}

/// Periodic probe-and-restart policy engine.
pub struct HealthChecker {
    supervisor: std::sync::Arc<Supervisor>,
    configs: HashMap<String, ServerConfig>,
    records: DashMap<String, HealthRecord>,
}

impl HealthChecker {
    pub fn new(supervisor: std::sync::Arc<Supervisor>, configs: HashMap<String, ServerConfig>) -> Self {
        Self {
            supervisor,
            configs,
            records: DashMap::new(),
        }
    }

    pub fn record(&self, name: &str) -> Option<HealthRecord> {
        self.records.get(name).map(|r| r.clone())
    }

    pub fn all_records(&self) -> HashMap<String, HealthRecord> {
        self.records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Run the probe loop forever, cancellable via `cancel`.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("health checker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
            }
        }
    }

    pub async fn probe_all(&self) {
        let names: Vec<String> = self.configs.keys().cloned().collect();
        for name in names {
            self.probe_once(&name).await;
        }
    }

    /// Probe a single configured server by name, updating its record and
    /// requesting a restart under policy if the failure threshold is hit.
    pub async fn probe_once(&self, name: &str) {
        let key = ChildKey::global(name);
        let started = Instant::now();

        let outcome = match self.supervisor.get(&key) {
            Some(child) => {
                let payload = json!({
                    "jsonrpc": "2.0",
                    "id": "health-probe",
                    "method": PROBE_METHOD,
                })
                .to_string()
                .into_bytes();
                child
                    .serializer()
                    .send_and_receive(payload, deadline_in(PROBE_DEADLINE_MS), CancellationToken::new())
                    .await
            }
            None => Err(crate::error::BridgeError::Communication(
                "child not running".into(),
            )),
        };

        let elapsed = started.elapsed();
        let mut record = self.records.entry(name.to_string()).or_default();
        record.last_check = Some(Instant::now());
        record.last_response_time = Some(elapsed);

        match outcome {
            Ok(_) => {
                record.status = HealthStatus::Healthy;
                record.consecutive_failures = 0;
            }
            Err(e) => {
                warn!("health probe for '{name}' failed: {e}");
                record.consecutive_failures += 1;
                record.status = HealthStatus::Unhealthy;

                if record.consecutive_failures >= FAILURE_THRESHOLD {
                    self.maybe_restart(name, &mut record).await;
                }
            }
        }
    }

    async fn maybe_restart(&self, name: &str, record: &mut HealthRecord) {
        if record.restart_window_start.elapsed() >= RESTART_WINDOW {
            record.restart_window_start = Instant::now();
            record.restart_count = 0;
        }

        if record.restart_count >= RESTART_CAP {
            warn!(
                "'{name}' hit the restart cap ({RESTART_CAP} in {:?}); leaving unhealthy",
                RESTART_WINDOW
            );
            return;
        }

        let Some(config) = self.configs.get(name).cloned() else {
            return;
        };
        let key = ChildKey::global(name);
        match self.supervisor.restart(&key, config).await {
            Ok(_) => {
                record.restart_count += 1;
                record.consecutive_failures = 0;
                info!("restarted '{name}' (restart {} of {RESTART_CAP} this window)", record.restart_count);
            }
            Err(e) => {
                warn!("failed to restart '{name}': {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn echo_config() -> ServerConfig {
        ServerConfig {
            command: "cat".into(),
            args: vec![],
            env: Map::new(),
            session_scoped: false,
        }
    }

    #[tokio::test]
    async fn probe_against_missing_child_records_unhealthy() {
        let sup = std::sync::Arc::new(Supervisor::with_default_queue_depth("/tmp/mcpbridge-test-health"));
        let mut configs = HashMap::new();
        configs.insert("echo".to_string(), echo_config());
        let checker = HealthChecker::new(sup, configs);

        checker.probe_once("echo").await;
        let record = checker.record("echo").unwrap();
        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert_eq!(record.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn restart_cap_stops_after_three_in_window() {
        let sup = std::sync::Arc::new(Supervisor::with_default_queue_depth("/tmp/mcpbridge-test-health2"));
        let mut configs = HashMap::new();
        configs.insert("dead".to_string(), ServerConfig {
            command: "false".into(),
            args: vec![],
            env: Map::new(),
            session_scoped: false,
        });
        let checker = HealthChecker::new(sup, configs);

        // A child that's never registered always fails the probe, which
        // exercises the failure-threshold path repeatedly.
        for _ in 0..12 {
            checker.probe_once("dead").await;
        }
        let record = checker.record("dead").unwrap();
        assert!(record.restart_count <= RESTART_CAP);
    }
}
