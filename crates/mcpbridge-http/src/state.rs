//! Shared application state threaded through every axum handler.

use std::sync::Arc;

use mcpbridge_core::{BridgeConfig, ConnectionManager, HealthChecker, SessionRegistry, Supervisor};

use crate::auth::{StaticTokenValidator, TokenValidator};
use crate::outbox::Outbox;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub supervisor: Arc<Supervisor>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub health: Arc<HealthChecker>,
    pub outbox: Arc<Outbox>,
    pub validator: Arc<dyn TokenValidator>,
}

impl AppState {
    pub fn new(
        config: Arc<BridgeConfig>,
        supervisor: Arc<Supervisor>,
        health: Arc<HealthChecker>,
    ) -> Self {
        let validator: Arc<dyn TokenValidator> =
            Arc::new(StaticTokenValidator::new(config.bearer_token.clone()));
        let connections = Arc::new(ConnectionManager::new(config.max_connections));
        Self {
            config,
            supervisor,
            sessions: Arc::new(SessionRegistry::new()),
            connections,
            health,
            outbox: Arc::new(Outbox::new()),
            validator,
        }
    }
}
