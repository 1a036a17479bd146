// MCP Client implementation

use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::registry::{Registry, ServerConfig, ServerStatus, TransportType};
use super::transport::{McpTransport, SseTransport, StdioTransport};
use super::types::*;

/// MCP Server connection
pub struct ServerConnection {
    pub name: String,
    pub description: String,
    pub transport_type: TransportType,
    pub address: String,
    transport: Box<dyn McpTransport>,
    available_tools: Vec<Tool>,
    server_info: Option<Implementation>,
}

impl ServerConnection {
    /// Open the configured transport, initialize it and list its tools
    pub async fn connect(config: &ServerConfig, timeout: Duration) -> Result<Self> {
        let transport: Box<dyn McpTransport> = match config.transport_type {
            TransportType::Sse => {
                let url = config
                    .url
                    .as_deref()
                    .with_context(|| format!("Server '{}' has no url", config.name))?;
                Box::new(
                    SseTransport::connect(url, timeout)
                        .await
                        .with_context(|| format!("Failed to connect to server '{}'", config.name))?,
                )
            }
            TransportType::Stdio => {
                let (program, args) = config
                    .program_and_args()
                    .with_context(|| format!("Server '{}' has no command", config.name))?;
                Box::new(
                    StdioTransport::spawn(
                        &program,
                        &args,
                        &config.env_vars,
                        config.working_directory.as_deref(),
                    )
                    .await
                    .with_context(|| {
                        format!("Failed to create transport for server '{}'", config.name)
                    })?
                    .with_timeout(timeout),
                )
            }
        };

        Self::with_transport(
            &config.name,
            &config.description,
            config.transport_type,
            config.address(),
            transport,
        )
        .await
    }

    /// Build a connection over an already opened transport
    pub async fn with_transport(
        name: &str,
        description: &str,
        transport_type: TransportType,
        address: String,
        transport: Box<dyn McpTransport>,
    ) -> Result<Self> {
        let mut connection = Self {
            name: name.to_string(),
            description: description.to_string(),
            transport_type,
            address,
            transport,
            available_tools: Vec::new(),
            server_info: None,
        };

        // Initialize the MCP connection
        connection.initialize().await?;

        // List available tools
        connection.refresh_tools().await?;

        Ok(connection)
    }

    /// Initialize the MCP connection
    async fn initialize(&mut self) -> Result<()> {
        let params = InitializeParams::default();

        let response = self
            .transport
            .request("initialize", Some(serde_json::to_value(params)?))
            .await
            .context("Failed to send initialize request")?;

        if let Some(result) = response.result {
            let init_result: InitializeResult = serde_json::from_value(result)
                .context("Failed to parse initialize response")?;

            debug!(
                "Server '{}' is {} {} (protocol {})",
                self.name,
                init_result.server_info.name,
                init_result.server_info.version,
                init_result.protocol_version
            );
            self.server_info = Some(init_result.server_info);
        }

        // Send initialized notification
        self.transport
            .notify("notifications/initialized", None)
            .await
            .context("Failed to send initialized notification")?;

        Ok(())
    }

    /// Refresh the list of available tools, following pagination cursors
    async fn refresh_tools(&mut self) -> Result<()> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = ListToolsParams {
                cursor: cursor.take(),
            };
            let response = self
                .transport
                .request("tools/list", Some(serde_json::to_value(params)?))
                .await
                .context("Failed to list tools")?;

            let Some(result) = response.result else { break };
            let page: ListToolsResult =
                serde_json::from_value(result).context("Failed to parse tools/list response")?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        self.available_tools = tools;
        Ok(())
    }

    /// Call a tool on this server
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };

        let response = self
            .transport
            .request("tools/call", Some(serde_json::to_value(params)?))
            .await
            .with_context(|| format!("Failed to call tool '{}'", name))?;

        let result = response.result.context("Tool call returned no result")?;
        serde_json::from_value(result).context("Failed to parse tools/call response")
    }

    /// Get available tools
    pub fn tools(&self) -> &[Tool] {
        &self.available_tools
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    pub async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close server '{}': {}", self.name, e);
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    server: String,
    tool: String,
    entry: usize,
}

/// MCP Client managing multiple server connections
pub struct McpClient {
    servers: Vec<ServerConnection>,
    catalog: Vec<ToolInfo>,
    routes: HashMap<String, Route>,
}

impl McpClient {
    /// Connect to every eligible server in the registry.
    ///
    /// SSE servers are only tried when the manager recorded them as running.
    /// stdio servers are spawned by the client itself. Failures are reported
    /// and skipped.
    pub async fn connect_all(registry: &Registry, timeout: Duration) -> Self {
        println!("[INFO] Loading {} server(s) from the registry", registry.len());

        let eligible: Vec<&ServerConfig> = registry
            .iter()
            .filter(|config| {
                let runnable = config.transport_type == TransportType::Stdio
                    || config.status == ServerStatus::Running;
                if !runnable {
                    println!("[WARN] Server {} is not running, skipping", config.name);
                }
                runnable
            })
            .collect();

        let attempts = join_all(
            eligible
                .iter()
                .map(|config| ServerConnection::connect(config, timeout)),
        )
        .await;

        let mut servers = Vec::new();
        for (config, attempt) in eligible.into_iter().zip(attempts) {
            match attempt {
                Ok(connection) => {
                    println!(
                        "[SUCCESS] Loaded server {}: {} tool(s)",
                        config.name,
                        connection.tools().len()
                    );
                    servers.push(connection);
                }
                Err(e) => {
                    eprintln!("[ERROR] Failed to connect to server {}: {:#}", config.name, e);
                }
            }
        }

        let client = Self::from_connections(servers);
        println!("[INFO] {} tool(s) available in total", client.catalog.len());
        client
    }

    /// Build the routing table over already established connections.
    ///
    /// A tool name belongs to the first server that exposes it; later
    /// servers offering the same name are reachable as `server.tool`.
    pub fn from_connections(servers: Vec<ServerConnection>) -> Self {
        let mut catalog = Vec::new();
        let mut routes = HashMap::new();

        for server in &servers {
            for tool in server.tools() {
                let qualified = format!("{}.{}", server.name, tool.name);
                let route = Route {
                    server: server.name.clone(),
                    tool: tool.name.clone(),
                    entry: catalog.len(),
                };

                let mut info = ToolInfo::from_tool(tool, &server.name);
                if let Some(owner) = routes.get(&tool.name).map(|r: &Route| r.server.clone()) {
                    warn!(
                        "Tool '{}' from server '{}' is shadowed by server '{}'; exposing it as '{}'",
                        tool.name, server.name, owner, qualified
                    );
                    info.name = qualified.clone();
                } else {
                    routes.insert(tool.name.clone(), route.clone());
                }
                routes.entry(qualified).or_insert(route);
                catalog.push(info);
            }
        }

        Self {
            servers,
            catalog,
            routes,
        }
    }

    /// Every routable tool, in server order
    pub fn all_tools(&self) -> &[ToolInfo] {
        &self.catalog
    }

    pub fn tool(&self, name: &str) -> Option<&ToolInfo> {
        self.routes.get(name).map(|route| &self.catalog[route.entry])
    }

    /// Call a tool by name. Failures come back as an unsuccessful result.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> ToolResult {
        let Some(route) = self.routes.get(name) else {
            return ToolResult::failure(name, format!("error: tool {} does not exist", name));
        };

        let Some(connection) = self.servers.iter().find(|s| s.name == route.server) else {
            return ToolResult::failure(
                name,
                format!("error: server {} is not connected", route.server),
            );
        };

        debug!("Calling tool '{}' on server '{}'", route.tool, route.server);
        match connection.call_tool(&route.tool, arguments).await {
            Ok(result) => {
                let mut tool_result = ToolResult::from(result);
                tool_result.name = name.to_string();
                if !tool_result.success {
                    debug!("Tool '{}' returned an error", name);
                }
                tool_result
            }
            Err(e) => ToolResult::failure(name, format!("tool call failed: {:#}", e)),
        }
    }

    /// Run several calls concurrently; results keep the order of `calls`
    pub async fn call_tools(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        join_all(
            calls
                .iter()
                .map(|call| self.call_tool(&call.name, call.arguments.clone())),
        )
        .await
    }

    /// Check if client has any servers connected
    pub fn has_servers(&self) -> bool {
        !self.servers.is_empty()
    }

    /// Get number of connected servers
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn servers(&self) -> &[ServerConnection] {
        &self.servers
    }

    /// Human readable listing of connected servers and their tools
    pub fn list_servers_and_tools(&self) -> String {
        let mut out = String::new();
        for server in &self.servers {
            out.push_str(&format!("\n📡 {}: {}\n", server.name, server.description));
            out.push_str(&format!("   transport: {}\n", server.transport_type));
            out.push_str(&format!("   address: {}\n", server.address));
            let tools: Vec<&ToolInfo> = self
                .catalog
                .iter()
                .filter(|t| t.server_name == server.name)
                .collect();
            out.push_str(&format!("   tools ({}):\n", tools.len()));
            for tool in tools {
                out.push_str(&format!("     - {}: {}\n", tool.name, tool.description));
            }
        }
        out
    }

    pub async fn shutdown(&self) {
        join_all(self.servers.iter().map(|s| s.close())).await;
    }
}
