// MCP server registry (mcp_servers.json)
//
// The registry is the file shared by the server manager, which writes pid and
// status, and the chat client, which reads it to decide what to connect to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Default registry file name, relative to the working directory
pub const DEFAULT_REGISTRY_FILE: &str = "mcp_servers.json";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to access registry '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse registry '{}': {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("invalid configuration for server '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("port {port} is already used by server '{existing}'")]
    DuplicatePort { port: u32, existing: String },
}

/// Transport type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Sse,
    Stdio,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Sse => "sse",
            TransportType::Stdio => "stdio",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sse" => Ok(TransportType::Sse),
            "stdio" => Ok(TransportType::Stdio),
            other => Err(format!("unknown transport type '{}' (expected sse or stdio)", other)),
        }
    }
}

/// Last known lifecycle state, as persisted by the manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
            ServerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

fn default_auto_start() -> bool {
    true
}

/// Individual MCP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Key of the entry in the registry object
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub transport_type: TransportType,
    /// Launch command. Split on whitespace unless `args` is given.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    #[serde(default)]
    pub health_check_endpoint: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub status: ServerStatus,
}

impl ServerConfig {
    fn empty(name: impl Into<String>, transport_type: TransportType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            transport_type,
            command: None,
            args: Vec::new(),
            url: None,
            port: None,
            working_directory: None,
            env_vars: BTreeMap::new(),
            auto_start: true,
            health_check_endpoint: None,
            pid: None,
            status: ServerStatus::Unknown,
        }
    }

    /// A server reached over HTTP+SSE at `url`
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::empty(name, TransportType::Sse);
        let url = url.into();
        // Only an explicit port; scheme defaults say nothing about the process
        config.port = reqwest::Url::parse(&url)
            .ok()
            .and_then(|u| u.port())
            .map(u32::from);
        config.url = Some(url);
        config
    }

    /// A server spawned as a child process speaking JSON-RPC on stdio
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        let mut config = Self::empty(name, TransportType::Stdio);
        config.command = Some(command.into());
        config
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port(mut self, port: u32) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_status(mut self, status: ServerStatus) -> Self {
        self.status = status;
        self
    }

    /// URL for SSE servers, launch command otherwise
    pub fn address(&self) -> String {
        match self.transport_type {
            TransportType::Sse => self.url.clone().unwrap_or_default(),
            TransportType::Stdio => {
                let mut parts: Vec<&str> = self.command.iter().map(String::as_str).collect();
                parts.extend(self.args.iter().map(String::as_str));
                parts.join(" ")
            }
        }
    }

    /// Port this entry occupies on this machine. Remote SSE servers claim
    /// none, local ones fall back to the port in their url.
    pub fn local_port(&self) -> Option<u32> {
        let url = self.url.as_deref().and_then(|u| reqwest::Url::parse(u).ok());
        match url {
            Some(url) if !is_local_host(url.host_str().unwrap_or_default()) => None,
            Some(url) => self
                .port
                .or_else(|| url.port_or_known_default().map(u32::from)),
            None => self.port,
        }
    }

    /// Program and argument vector to spawn, `None` when no command is set
    pub fn program_and_args(&self) -> Option<(String, Vec<String>)> {
        let command = self.command.as_deref()?.trim();
        if command.is_empty() {
            return None;
        }

        if !self.args.is_empty() {
            return Some((command.to_string(), self.args.clone()));
        }

        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some((program, parts.collect()))
    }

    /// Hard validation errors
    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::Invalid {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("server name must not be empty".to_string()));
        }

        if let Some(port) = self.port {
            if port == 0 || port > u32::from(u16::MAX) {
                return Err(invalid(format!("port {} is outside 1-65535", port)));
            }
        }

        match self.transport_type {
            TransportType::Stdio => {
                if self.program_and_args().is_none() {
                    return Err(invalid("stdio servers need a launch command".to_string()));
                }
            }
            TransportType::Sse => {
                let url = self
                    .url
                    .as_deref()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| invalid("sse servers need a url".to_string()))?;
                let parsed = reqwest::Url::parse(url)
                    .map_err(|e| invalid(format!("url '{}' is not valid: {}", url, e)))?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(invalid(format!(
                        "url '{}' must use http or https",
                        url
                    )));
                }
            }
        }

        Ok(())
    }

    /// Soft problems worth telling the user about
    pub fn hints(&self) -> Vec<String> {
        let mut hints = Vec::new();

        if self.transport_type == TransportType::Sse {
            let url_port = self
                .url
                .as_deref()
                .and_then(|u| reqwest::Url::parse(u).ok())
                .and_then(|u| u.port_or_known_default())
                .map(u32::from);
            if let (Some(port), Some(url_port)) = (self.port, url_port) {
                if port != url_port {
                    hints.push(format!(
                        "server '{}': port {} differs from the url port {}",
                        self.name, port, url_port
                    ));
                }
            }
            if self.command.is_none() && self.auto_start {
                hints.push(format!(
                    "server '{}': auto_start is set but there is no command to start it",
                    self.name
                ));
            }
        }

        hints
    }
}

/// Ordered collection of server configurations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    servers: Vec<ServerConfig>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry used when none exists yet
    pub fn with_defaults() -> Self {
        let mut weather = ServerConfig::sse("weather_server", "http://127.0.0.1:8000/sse")
            .with_description("Weather lookup MCP server")
            .with_command("python weather_server.py")
            .with_port(8000);
        weather.working_directory = std::env::current_dir().ok();
        weather.health_check_endpoint = Some("/sse".to_string());

        Self {
            servers: vec![weather],
        }
    }

    /// Load a registry file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                RegistryError::NotFound(path.to_path_buf())
            } else {
                RegistryError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let registry = Self::from_json(&content).map_err(|reason| RegistryError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;

        debug!(
            "Loaded {} server configuration(s) from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Load a registry file, writing the default one when it is missing or broken
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(registry) => Ok(registry),
            Err(RegistryError::NotFound(_)) => {
                println!("[INFO] Creating default MCP server registry at {}", path.display());
                let registry = Self::with_defaults();
                registry.save(path)?;
                Ok(registry)
            }
            Err(e @ RegistryError::Parse { .. }) => {
                warn!("{}; replacing it with the default registry", e);
                println!("[ERROR] {} (falling back to defaults)", e);
                let registry = Self::with_defaults();
                registry.save(path)?;
                Ok(registry)
            }
            Err(e) => Err(e),
        }
    }

    /// Parse the JSON object form
    pub fn from_json(content: &str) -> Result<Self, String> {
        let value: serde_json::Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
        let object = value
            .as_object()
            .ok_or_else(|| "top-level value must be an object keyed by server name".to_string())?;

        let mut servers = Vec::with_capacity(object.len());
        for (name, entry) in object {
            let mut config: ServerConfig = serde_json::from_value(entry.clone())
                .map_err(|e| format!("server '{}': {}", name, e))?;
            config.name = name.clone();
            servers.push(config);
        }

        Ok(Self { servers })
    }

    /// Render the JSON object form (2-space indent, entries in registry order)
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut object = serde_json::Map::new();
        for config in &self.servers {
            object.insert(config.name.clone(), serde_json::to_value(config)?);
        }
        serde_json::to_string_pretty(&serde_json::Value::Object(object))
    }

    /// Write the registry, replacing the file atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RegistryError> {
        let path = path.as_ref();
        let io_err = |source: io::Error| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        };

        let json = self.to_json().map_err(|e| RegistryError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_REGISTRY_FILE.to_string());
        let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(&tmp_path, json.as_bytes()).map_err(io_err)?;
        fs::rename(&tmp_path, path).map_err(io_err)?;

        debug!("Registry saved to {}", path.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServerConfig> {
        self.servers.iter_mut().find(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Server other than `except` that already claims `port`
    pub fn port_owner(&self, port: u32, except: Option<&str>) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.local_port() == Some(port) && Some(s.name.as_str()) != except)
    }

    /// Insert or replace without validation
    pub fn upsert(&mut self, config: ServerConfig) {
        match self.get_mut(&config.name) {
            Some(existing) => *existing = config,
            None => self.servers.push(config),
        }
    }

    /// Validate, check the port is free, then insert or replace
    pub fn add(&mut self, config: ServerConfig) -> Result<(), RegistryError> {
        config.validate()?;

        if let Some(port) = config.local_port() {
            if let Some(owner) = self.port_owner(port, Some(&config.name)) {
                return Err(RegistryError::DuplicatePort {
                    port,
                    existing: owner.name.clone(),
                });
            }
        }

        self.upsert(config);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<ServerConfig, RegistryError> {
        let index = self
            .servers
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| RegistryError::ServerNotFound(name.to_string()))?;
        Ok(self.servers.remove(index))
    }

    /// `(port, first owner, second owner)` for every shared port
    pub fn duplicate_ports(&self) -> Vec<(u32, String, String)> {
        let mut seen: BTreeMap<u32, &str> = BTreeMap::new();
        let mut duplicates = Vec::new();

        for server in &self.servers {
            if let Some(port) = server.local_port() {
                match seen.get(&port) {
                    Some(first) => duplicates.push((port, first.to_string(), server.name.clone())),
                    None => {
                        seen.insert(port, &server.name);
                    }
                }
            }
        }

        duplicates
    }

    /// Every validation error in the registry, including shared ports
    pub fn validate(&self) -> Vec<RegistryError> {
        let mut errors: Vec<RegistryError> = self
            .servers
            .iter()
            .filter_map(|s| s.validate().err())
            .collect();

        for (port, first, _second) in self.duplicate_ports() {
            errors.push(RegistryError::DuplicatePort {
                port,
                existing: first,
            });
        }

        errors
    }

    pub fn hints(&self) -> Vec<String> {
        self.servers.iter().flat_map(|s| s.hints()).collect()
    }
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0" | "::1" | "[::1]")
}
