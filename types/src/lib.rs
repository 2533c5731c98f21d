//! Shared wire types for the sluss MCP session engine.
//!
//! This crate contains the JSON-RPC 2.0 envelopes and the stream event
//! model shared between the backend and embedding binaries.

/// Default port for the sluss backend server.
pub const DEFAULT_PORT: u16 = 8080;

/// MCP protocol version the server speaks.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Header name for the MCP session ID.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Header name for the last event sequence a resuming client has seen.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub mod event;
pub mod rpc;

// Re-export commonly used types
pub use event::{EventKind, StreamEvent};
pub use rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
