//! Core subsystem of the MCP remote-to-local bridge: the child-process
//! supervisor, the per-child request/response serializer, the protocol
//! translator, the session and connection managers, and the operation
//! tracker and health checker that keep long-running tool calls from
//! being torn down prematurely.

pub mod child;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod operation;
pub mod serializer;
pub mod session;
pub mod sweeper;
pub mod translator;

pub use child::{Child, ChildKey, Supervisor};
pub use config::{BridgeConfig, ServerConfig};
pub use connection::ConnectionManager;
pub use error::{BridgeError, BridgeResult};
pub use health::HealthChecker;
pub use operation::{OpId, OperationRecord, OperationTracker};
pub use session::SessionRegistry;
pub use sweeper::StaleSweeper;
