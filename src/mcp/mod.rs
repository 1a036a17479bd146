// MCP (Model Context Protocol) module
//
// Server registry, JSON-RPC types, transports and the multi-server client.

pub mod client;
pub mod registry;
pub mod transport;
pub mod types;

pub use client::McpClient;
pub use registry::{Registry, ServerConfig, ServerStatus, TransportType};
