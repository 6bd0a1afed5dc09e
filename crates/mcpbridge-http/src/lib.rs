//! Axum HTTP surface for the MCP remote-to-local bridge: subdomain-scoped
//! SSE streaming endpoint, the paired session POST endpoint,
//! health/introspection routes, and the bearer-token guard that fronts
//! all of them.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod outbox;
pub mod router;
pub mod routing;
pub mod state;
pub mod stream;

pub use error::HttpError;
pub use router::build_router;
pub use state::AppState;
