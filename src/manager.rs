// MCP server lifecycle manager.
//
// Starts and stops the servers listed in the registry, checks their health
// and discovers SSE servers already listening on local ports. Process ids
// and status are written back to the registry so that later invocations,
// and the chat client, see the same state.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ManagerSettings;
use crate::mcp::registry::{Registry, RegistryError, ServerConfig, ServerStatus, TransportType};

type Result<T> = std::result::Result<T, ManagerError>;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("server '{name}' has no command to start it")]
    NoCommand { name: String },

    #[error("failed to start server '{name}': {source}")]
    StartFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning,
    /// The process is up but its endpoint did not answer in time
    StartedUnhealthy { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Ignored SIGTERM and was killed
    Killed,
    /// No process was known for the server
    NotManaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
            Health::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerStatusReport {
    pub name: String,
    pub description: String,
    pub transport_type: TransportType,
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub url: Option<String>,
    pub health: Health,
}

pub struct ServerManager {
    registry: Registry,
    path: PathBuf,
    processes: HashMap<String, Child>,
    settings: ManagerSettings,
    http: reqwest::Client,
    forward_stderr: bool,
}

impl ServerManager {
    /// Load the registry at `path`, creating the default one if needed
    pub fn open(path: impl AsRef<Path>, settings: ManagerSettings) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let registry = Registry::load_or_default(&path)?;

        for (port, first, second) in registry.duplicate_ports() {
            warn!("Port {} is configured for both '{}' and '{}'", port, first, second);
        }
        for error in registry.validate() {
            warn!("{}", error);
        }

        Ok(Self {
            registry,
            path,
            processes: HashMap::new(),
            settings,
            http: reqwest::Client::new(),
            forward_stderr: true,
        })
    }

    /// Send server stderr to the null device instead of the log. Needed when
    /// this process exits while the servers keep running.
    pub fn detached(mut self) -> Self {
        self.forward_stderr = false;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        self.registry.save(&self.path)?;
        Ok(())
    }

    fn config(&self, name: &str) -> Result<ServerConfig> {
        self.registry
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ServerNotFound(name.to_string()).into())
    }

    fn set_state(&mut self, name: &str, status: ServerStatus, pid: Option<u32>) -> Result<()> {
        if let Some(config) = self.registry.get_mut(name) {
            config.status = status;
            config.pid = pid;
        }
        self.save()
    }

    /// Validate and add (or replace) a server, then save
    pub fn add_server(&mut self, config: ServerConfig) -> Result<()> {
        for hint in config.hints() {
            warn!("{}: {}", config.name, hint);
        }
        let name = config.name.clone();
        self.registry.add(config)?;
        self.save()?;
        info!("Added server '{}'", name);
        Ok(())
    }

    /// Stop the server if it runs, then remove it and save
    pub async fn remove_server(&mut self, name: &str) -> Result<ServerConfig> {
        if !self.registry.contains(name) {
            return Err(RegistryError::ServerNotFound(name.to_string()).into());
        }
        self.stop_server(name).await?;
        let removed = self.registry.remove(name)?;
        self.save()?;
        info!("Removed server '{}'", name);
        Ok(removed)
    }

    pub async fn start_server(&mut self, name: &str) -> Result<StartOutcome> {
        let config = self.config(name)?;

        if config.transport_type == TransportType::Sse && self.probe(&config).await {
            info!("Server '{}' is already running", name);
            self.set_state(name, ServerStatus::Running, config.pid)?;
            return Ok(StartOutcome::AlreadyRunning);
        }

        let pid = self.spawn(&config)?;

        if config.transport_type == TransportType::Stdio {
            return Ok(StartOutcome::Started { pid });
        }

        tokio::time::sleep(self.settings.startup_grace).await;
        if self.probe(&config).await {
            info!("Server '{}' started (pid {})", name, pid);
            Ok(StartOutcome::Started { pid })
        } else {
            warn!(
                "Server '{}' started (pid {}) but {} is not answering",
                name,
                pid,
                config.url.as_deref().unwrap_or("its endpoint")
            );
            Ok(StartOutcome::StartedUnhealthy { pid })
        }
    }

    fn spawn(&mut self, config: &ServerConfig) -> Result<u32> {
        let name = config.name.clone();
        let (program, args) = config
            .program_and_args()
            .ok_or_else(|| ManagerError::NoCommand { name: name.clone() })?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&config.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(if self.forward_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &config.working_directory {
            cmd.current_dir(dir);
        }

        debug!("Spawning '{}': {} {:?}", name, program, args);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.set_state(&name, ServerStatus::Error, None)?;
                return Err(ManagerError::StartFailed { name, source });
            }
        };

        let Some(pid) = child.id() else {
            self.set_state(&name, ServerStatus::Error, None)?;
            return Err(ManagerError::StartFailed {
                name,
                source: io::Error::other("process exited immediately"),
            });
        };

        if let Some(stderr) = child.stderr.take() {
            let label = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %label, "stderr: {}", line);
                }
            });
        }

        self.processes.insert(name.clone(), child);
        self.set_state(&name, ServerStatus::Running, Some(pid))?;
        Ok(pid)
    }

    /// SIGTERM, then SIGKILL after the stop grace period
    pub async fn stop_server(&mut self, name: &str) -> Result<StopOutcome> {
        let Some(config) = self.registry.get(name).cloned() else {
            return Ok(StopOutcome::NotManaged);
        };

        let outcome = if let Some(mut child) = self.processes.remove(name) {
            terminate_child(&mut child, self.settings.stop_grace).await?
        } else if let Some(pid) = live_pid(&config) {
            terminate_pid(pid, self.settings.stop_grace).await?
        } else {
            if let Some(pid) = config.pid {
                debug!("Dropping stale pid {} of '{}'", pid, name);
            }
            StopOutcome::NotManaged
        };

        if outcome == StopOutcome::Killed {
            warn!("Server '{}' did not exit after SIGTERM and was killed", name);
        }

        self.set_state(name, ServerStatus::Stopped, None)?;
        Ok(outcome)
    }

    /// Start every server marked `auto_start`; failures do not stop the rest
    pub async fn start_all(&mut self) -> Vec<(String, Result<StartOutcome>)> {
        let names: Vec<String> = self
            .registry
            .iter()
            .filter(|c| c.auto_start)
            .map(|c| c.name.clone())
            .collect();

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.start_server(&name).await;
            results.push((name, result));
        }
        results
    }

    /// Stop every server this manager or an earlier run started
    pub async fn stop_all(&mut self) -> Vec<(String, Result<StopOutcome>)> {
        let names: Vec<String> = self
            .registry
            .iter()
            .filter(|c| self.processes.contains_key(&c.name) || live_pid(c).is_some())
            .map(|c| c.name.clone())
            .collect();

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.stop_server(&name).await;
            results.push((name, result));
        }
        results
    }

    async fn probe(&self, config: &ServerConfig) -> bool {
        match health_url(config) {
            Some(url) => probe_sse(&self.http, &url, self.settings.health_timeout).await,
            None => false,
        }
    }

    /// SSE servers must answer on their url; stdio servers must have a live
    /// process
    pub async fn check_health(&mut self, name: &str) -> bool {
        let Some(config) = self.registry.get(name).cloned() else {
            return false;
        };

        match config.transport_type {
            TransportType::Sse => self.probe(&config).await,
            TransportType::Stdio => {
                if let Some(child) = self.processes.get_mut(name) {
                    matches!(child.try_wait(), Ok(None))
                } else {
                    live_pid(&config).is_some()
                }
            }
        }
    }

    pub async fn server_status(&mut self, name: &str) -> Result<ServerStatusReport> {
        let config = self.config(name)?;
        let health = if config.status == ServerStatus::Running {
            if self.check_health(name).await {
                Health::Healthy
            } else {
                Health::Unhealthy
            }
        } else {
            Health::Unknown
        };

        Ok(ServerStatusReport {
            name: config.name,
            description: config.description,
            transport_type: config.transport_type,
            status: config.status,
            pid: config.pid,
            url: config.url,
            health,
        })
    }

    pub async fn list_servers(&mut self) -> Vec<ServerStatusReport> {
        let names = self.registry.names();
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(report) = self.server_status(&name).await {
                reports.push(report);
            }
        }
        reports
    }

    /// Probe the local discovery port range and register SSE servers that
    /// answer and are not yet known. Returns the names added, by port.
    pub async fn discover_running_servers(&mut self) -> Result<Vec<String>> {
        let start = self.settings.discovery_start;
        let end = self.settings.discovery_end;
        let timeout = self.settings.discovery_timeout;
        let http = self.http.clone();

        debug!("Scanning ports {}..={}", start, end);
        let mut found: Vec<u16> = stream::iter(start..=end)
            .map(|port| {
                let http = http.clone();
                async move {
                    let url = discovery_url(port);
                    (port, probe_sse(&http, &url, timeout).await)
                }
            })
            .buffer_unordered(self.settings.discovery_concurrency.max(1))
            .filter_map(|(port, alive)| async move { alive.then_some(port) })
            .collect()
            .await;
        found.sort_unstable();

        let mut added = Vec::new();
        for port in found {
            let name = format!("discovered_server_{}", port);
            if self.registry.contains(&name) {
                continue;
            }
            if let Some(owner) = self.registry.port_owner(u32::from(port), None) {
                debug!("Port {} already belongs to '{}'", port, owner.name);
                continue;
            }

            let config = ServerConfig::sse(&name, discovery_url(port))
                .with_description(format!("Auto-discovered MCP server (port {})", port))
                .with_port(u32::from(port))
                .with_auto_start(false)
                .with_status(ServerStatus::Running);
            self.registry.upsert(config);
            info!("Discovered MCP server on port {}", port);
            added.push(name);
        }

        if !added.is_empty() {
            self.save()?;
        }
        Ok(added)
    }
}

/// `health_check_endpoint` when set (absolute, or a path on the server's
/// url), the SSE url otherwise
fn health_url(config: &ServerConfig) -> Option<String> {
    let url = config.url.as_deref();
    match config.health_check_endpoint.as_deref().map(str::trim) {
        Some(endpoint) if endpoint.starts_with("http://") || endpoint.starts_with("https://") => {
            Some(endpoint.to_string())
        }
        Some(endpoint) if !endpoint.is_empty() => {
            let base = reqwest::Url::parse(url?).ok()?;
            base.join(endpoint).ok().map(String::from)
        }
        _ => url.map(str::to_string),
    }
}

fn discovery_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/sse", port)
}

/// `HEAD url`, retried as `GET` when the server only allows `GET`. Healthy
/// means status 200; the body is never read.
pub async fn probe_sse(http: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    let status = match http.head(url).timeout(timeout).send().await {
        Ok(response) => response.status(),
        Err(e) => {
            debug!("HEAD {} failed: {}", url, e);
            return false;
        }
    };

    if status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
        // Only waits for the response head
        return match tokio::time::timeout(timeout, http.get(url).send()).await {
            Ok(Ok(response)) => response.status() == reqwest::StatusCode::OK,
            Ok(Err(e)) => {
                debug!("GET {} failed: {}", url, e);
                false
            }
            Err(_) => false,
        };
    }

    status == reqwest::StatusCode::OK
}

/// Whether a process with this pid exists
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks that the process exists
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Persisted pid of `config`, if that process is alive and still runs the
/// configured command
fn live_pid(config: &ServerConfig) -> Option<u32> {
    config
        .pid
        .filter(|pid| is_alive(*pid) && runs_command(*pid, config))
}

/// Whether `pid` runs the command configured for `config`. The program may
/// appear under a longer name (`python` as `python3`) or a full path.
#[cfg(target_os = "linux")]
fn runs_command(pid: u32, config: &ServerConfig) -> bool {
    let Some((program, args)) = config.program_and_args() else {
        return false;
    };
    let Ok(raw) = std::fs::read(format!("/proc/{}/cmdline", pid)) else {
        return false;
    };

    let basename = |path: &str| -> String {
        Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string())
    };
    let cmdline: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();

    let program = basename(&program);
    cmdline.iter().any(|token| basename(token).starts_with(&program))
        && args.iter().all(|arg| cmdline.contains(arg))
}

#[cfg(not(target_os = "linux"))]
fn runs_command(_pid: u32, _config: &ServerConfig) -> bool {
    true
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    let raw = libc::pid_t::try_from(pid).map_err(|e| ManagerError::Signal {
        pid,
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })?;
    if unsafe { libc::kill(raw, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone
        return Ok(());
    }
    Err(ManagerError::Signal { pid, source: err })
}

async fn terminate_child(child: &mut Child, grace: Duration) -> Result<StopOutcome> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(StopOutcome::Stopped);
    };

    send_signal(pid, libc::SIGTERM)?;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => Ok(StopOutcome::Stopped),
        Err(_) => {
            child
                .kill()
                .await
                .map_err(|source| ManagerError::Signal { pid, source })?;
            Ok(StopOutcome::Killed)
        }
    }
}

async fn terminate_pid(pid: u32, grace: Duration) -> Result<StopOutcome> {
    send_signal(pid, libc::SIGTERM)?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return Ok(StopOutcome::Stopped);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    if is_alive(pid) {
        send_signal(pid, libc::SIGKILL)?;
        Ok(StopOutcome::Killed)
    } else {
        Ok(StopOutcome::Stopped)
    }
}
