//! Connection Manager.
//!
//! Tracks active streaming connections in a bounded map keyed by session
//! id, enforces the connection cap, and sweeps stale entries on a fixed
//! cadence. The stream handler borrows `cancel` from the record it owns
//! to tear itself down; the Connection Manager otherwise exclusively owns
//! the table.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BridgeError, BridgeResult};

/// Default cap on concurrent streaming connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Activity staleness threshold.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(120);

pub struct ConnectionRecord {
    pub session_id: String,
    pub server_name: String,
    pub started_at: Instant,
    pub cancel: CancellationToken,
}

/// Tracks active connections and enforces the configured cap.
pub struct ConnectionManager {
    connections: DashMap<String, ConnectionRecord>,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_connections,
        }
    }

    pub fn with_default_cap() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS)
    }

    /// Register a new streaming connection. Rejects with `CapExceeded`
    /// once `max_connections` active entries already exist.
    pub fn register(&self, session_id: &str, server_name: &str) -> BridgeResult<CancellationToken> {
        if self.connections.len() >= self.max_connections {
            return Err(BridgeError::CapExceeded(format!(
                "connection cap of {} reached",
                self.max_connections
            )));
        }
        let cancel = CancellationToken::new();
        self.connections.insert(
            session_id.to_string(),
            ConnectionRecord {
                session_id: session_id.to_string(),
                server_name: server_name.to_string(),
                started_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    pub fn remove(&self, session_id: &str) {
        if let Some((_, record)) = self.connections.remove(session_id) {
            record.cancel.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.connections.contains_key(session_id)
    }

    /// The cancellation token a request against this session should race
    /// against, so a stale-sweep cancellation fails outstanding tickets
    /// rather than leaving them to their own deadline.
    pub fn cancel_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.connections.get(session_id).map(|r| r.cancel.clone())
    }

    pub fn server_name(&self, session_id: &str) -> Option<String> {
        self.connections.get(session_id).map(|r| r.server_name.clone())
    }

    /// Cancel and remove every connection with no activity (per
    /// `last_activity`, supplied by the caller from the Session Registry)
    /// older than `stale_after`. Returns the ids reaped.
    pub fn sweep_stale(&self, is_stale: impl Fn(&str) -> bool) -> Vec<String> {
        let stale_ids: Vec<String> = self
            .connections
            .iter()
            .filter(|e| is_stale(e.key()))
            .map(|e| e.key().clone())
            .collect();

        for id in &stale_ids {
            self.remove(id);
        }
        if !stale_ids.is_empty() {
            info!("stale sweep reaped {} connection(s)", stale_ids.len());
        } else {
            debug!("stale sweep found nothing to reap");
        }
        stale_ids
    }

    /// Force-cleanup entry point for administrative callers (the
    /// `/cleanup` endpoint), using wall-clock staleness against
    /// `started_at` alone (no external activity oracle needed).
    pub fn force_cleanup_older_than(&self, age: Duration) -> Vec<String> {
        let now = Instant::now();
        self.sweep_stale(|id| {
            self.connections
                .get(id)
                .map(|r| now.duration_since(r.started_at) >= age)
                .unwrap_or(false)
        })
    }
}
