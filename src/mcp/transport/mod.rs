// Transports for MCP communication
//
// Both transports carry the same JSON-RPC messages; they differ only in how
// a request reaches the server and how its response comes back.

pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::mcp::types::JsonRpcResponse;

pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Default time to wait for a single response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn MCP server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("timeout waiting for response from MCP server ({secs} seconds). Method: {method}")]
    Timeout { method: String, secs: u64 },

    #[error("MCP server closed the connection")]
    Closed,

    #[error("MCP server returned error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("I/O error talking to MCP server: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error talking to MCP server: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid JSON-RPC message: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

/// A bidirectional JSON-RPC channel to one MCP server
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for the response with the matching id.
    ///
    /// A JSON-RPC error response is returned as `TransportError::Server`.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a notification (no response expected)
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError>;

    /// Tear the connection down. Further requests fail with `Closed`.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Turn a JSON-RPC error object into a transport error
pub(crate) fn check_response(response: JsonRpcResponse) -> Result<JsonRpcResponse, TransportError> {
    if let Some(error) = &response.error {
        return Err(TransportError::Server {
            code: error.code,
            message: error.message.clone(),
        });
    }
    Ok(response)
}
