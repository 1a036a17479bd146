use directories::ProjectDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_API_KEY_ENV: &str = "DEEPSEEK_API_KEY";
pub const DEFAULT_LOG_FILE: &str = "mcp_stream_debug.log";

/// Settings for the streaming chat model
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub api_key_env: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
        }
    }
}

/// Settings for the multi-server client and chat loop
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub request_timeout: Duration,
    pub log_file: PathBuf,
    pub typewriter_delay: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            typewriter_delay: Duration::from_millis(30),
        }
    }
}

/// Settings for the server manager
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub startup_grace: Duration,
    pub stop_grace: Duration,
    pub health_timeout: Duration,
    pub discovery_start: u16,
    pub discovery_end: u16,
    pub discovery_timeout: Duration,
    pub discovery_concurrency: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(2),
            stop_grace: Duration::from_secs(5),
            health_timeout: Duration::from_secs(5),
            discovery_start: 8000,
            discovery_end: 8998,
            discovery_timeout: Duration::from_secs(2),
            discovery_concurrency: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    pub llm: LlmSettings,
    pub client: ClientSettings,
    pub manager: ManagerSettings,
}

#[derive(Deserialize, Default)]
struct LlmConfig {
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    api_key_env: Option<String>,
}

#[derive(Deserialize, Default)]
struct ClientConfig {
    request_timeout_secs: Option<u64>,
    log_file: Option<PathBuf>,
    typewriter_delay_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct ManagerConfig {
    startup_grace_secs: Option<u64>,
    stop_grace_secs: Option<u64>,
    health_timeout_secs: Option<u64>,
    discovery_start: Option<u16>,
    discovery_end: Option<u16>,
    discovery_timeout_secs: Option<u64>,
    discovery_concurrency: Option<usize>,
}

#[derive(Deserialize, Default)]
struct RawConfig {
    llm: Option<LlmConfig>,
    client: Option<ClientConfig>,
    manager: Option<ManagerConfig>,
}

impl AppConfig {
    /// Load from `explicit` or the per-user config file, then apply
    /// environment overrides. Problems fall back to defaults.
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = explicit.map(Path::to_path_buf).or_else(config_path);

        let mut config = match path {
            Some(path) => Self::from_file(&path, explicit.is_some()),
            None => AppConfig::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        debug!("Loaded configuration: {:?}", config);
        config
    }

    fn from_file(path: &Path, explicit: bool) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        "Failed to parse config file '{}': {} (falling back to defaults)",
                        path.display(),
                        e
                    );
                    AppConfig::default()
                }
            },
            Err(e) => {
                if explicit {
                    warn!(
                        "Could not read config file '{}': {} (using defaults)",
                        path.display(),
                        e
                    );
                } else {
                    debug!("No config file at '{}': {}", path.display(), e);
                }
                AppConfig::default()
            }
        }
    }

    /// Parse TOML, keeping defaults for missing or invalid values
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let raw: RawConfig = toml::from_str(content)?;
        let mut config = AppConfig::default();

        if let Some(llm) = raw.llm {
            if let Some(url) = non_empty(llm.base_url) {
                config.llm.base_url = url.trim_end_matches('/').to_string();
            }
            if let Some(model) = non_empty(llm.model) {
                config.llm.model = model;
            }
            if let Some(t) = llm.temperature.filter(|t| (0.0..=2.0).contains(t)) {
                config.llm.temperature = t;
            }
            if let Some(env) = non_empty(llm.api_key_env) {
                config.llm.api_key_env = env;
            }
        }

        if let Some(client) = raw.client {
            if let Some(secs) = positive(client.request_timeout_secs) {
                config.client.request_timeout = Duration::from_secs(secs);
            }
            if let Some(path) = client.log_file.filter(|p| !p.as_os_str().is_empty()) {
                config.client.log_file = path;
            }
            if let Some(ms) = client.typewriter_delay_ms {
                config.client.typewriter_delay = Duration::from_millis(ms);
            }
        }

        if let Some(manager) = raw.manager {
            let m = &mut config.manager;
            if let Some(secs) = manager.startup_grace_secs {
                m.startup_grace = Duration::from_secs(secs);
            }
            if let Some(secs) = positive(manager.stop_grace_secs) {
                m.stop_grace = Duration::from_secs(secs);
            }
            if let Some(secs) = positive(manager.health_timeout_secs) {
                m.health_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = positive(manager.discovery_timeout_secs) {
                m.discovery_timeout = Duration::from_secs(secs);
            }
            if let Some(n) = manager.discovery_concurrency.filter(|n| *n > 0) {
                m.discovery_concurrency = n;
            }

            let start = manager.discovery_start.unwrap_or(m.discovery_start);
            let end = manager.discovery_end.unwrap_or(m.discovery_end);
            if start > 0 && start <= end {
                m.discovery_start = start;
                m.discovery_end = end;
            } else {
                warn!("Ignoring invalid discovery range {}..={}", start, end);
            }
        }

        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = non_empty(lookup("MCP_STREAM_MODEL")) {
            self.llm.model = model;
        }
        if let Some(url) = non_empty(lookup("MCP_STREAM_BASE_URL")) {
            self.llm.base_url = url.trim_end_matches('/').to_string();
        }
    }
}

fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "mcp-stream-cli").map(|dirs| dirs.config_dir().join("config.toml"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v > 0)
}
