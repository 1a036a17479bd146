use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use mcp_stream_cli::chat::{self, ChatSession};
use mcp_stream_cli::config::AppConfig;
use mcp_stream_cli::context_log::ContextLog;
use mcp_stream_cli::demo_server;
use mcp_stream_cli::llm::OpenAiCompatible;
use mcp_stream_cli::manager::{ServerManager, ServerStatusReport, StartOutcome, StopOutcome};
use mcp_stream_cli::mcp::registry::{
    Registry, RegistryError, ServerConfig, TransportType, DEFAULT_REGISTRY_FILE,
};
use mcp_stream_cli::mcp::McpClient;

#[derive(Parser)]
#[command(name = "mcp-stream-cli")]
#[command(about = "Manage MCP servers and chat with an LLM that can call their tools", long_about = None)]
struct Cli {
    /// Application config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// MCP server registry file
    #[arg(long, global = true, default_value = DEFAULT_REGISTRY_FILE)]
    registry: PathBuf,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the MCP servers in the registry
    Servers {
        #[command(subcommand)]
        action: ServerAction,
    },

    /// Interactive server management menu
    Manage,

    /// Chat with the LLM using the tools of every loaded server
    Chat {
        /// Answer a single query and exit
        #[arg(short, long)]
        query: Option<String>,

        /// Start even when no MCP server could be loaded
        #[arg(long)]
        allow_no_servers: bool,
    },

    /// Run the built-in demo MCP server on stdin/stdout
    DemoServer,
}

#[derive(Subcommand)]
enum ServerAction {
    /// Show every server with its status and health
    List,
    /// Start one server
    Start { name: String },
    /// Stop one server
    Stop { name: String },
    /// Start every server marked auto_start
    StartAll,
    /// Stop every running server
    StopAll,
    /// Find SSE servers listening on local ports
    Discover,
    /// Show one server
    Status { name: String },
    /// Add or replace a server
    Add {
        name: String,
        /// sse or stdio
        #[arg(long, default_value = "sse")]
        transport: TransportType,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        port: Option<u32>,
        /// Launch command
        #[arg(long)]
        command: Option<String>,
        /// Argument for the command (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        working_directory: Option<PathBuf>,
        /// Environment variable KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_env_var)]
        env_vars: Vec<(String, String)>,
        /// Skip this server in start-all
        #[arg(long)]
        no_auto_start: bool,
    },
    /// Stop and remove a server
    Remove { name: String },
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(k, _)| !k.trim().is_empty())
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    init_logging(cli.verbose);

    let config = AppConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::DemoServer => demo_server::run_stdio().await?,
        Commands::Servers { action } => run_servers(action, &cli.registry, &config).await?,
        Commands::Manage => {
            let manager = ServerManager::open(&cli.registry, config.manager.clone())?;
            run_menu(manager).await?;
        }
        Commands::Chat {
            query,
            allow_no_servers,
        } => run_chat(&cli.registry, &config, query, allow_no_servers).await?,
    }

    Ok(())
}

async fn run_servers(action: ServerAction, registry: &Path, config: &AppConfig) -> Result<()> {
    // Servers must outlive this process
    let mut manager = ServerManager::open(registry, config.manager.clone())?.detached();

    match action {
        ServerAction::List => print_reports(&manager.list_servers().await),
        ServerAction::Status { name } => {
            let report = manager.server_status(&name).await?;
            print_reports(std::slice::from_ref(&report));
        }
        ServerAction::Start { name } => {
            let outcome = manager.start_server(&name).await?;
            print_start(&name, outcome);
        }
        ServerAction::Stop { name } => {
            let outcome = manager.stop_server(&name).await?;
            print_stop(&name, outcome);
        }
        ServerAction::StartAll => {
            for (name, result) in manager.start_all().await {
                match result {
                    Ok(outcome) => print_start(&name, outcome),
                    Err(e) => println!("[ERROR] {}", e),
                }
            }
        }
        ServerAction::StopAll => {
            for (name, result) in manager.stop_all().await {
                match result {
                    Ok(outcome) => print_stop(&name, outcome),
                    Err(e) => println!("[ERROR] {}", e),
                }
            }
        }
        ServerAction::Discover => print_discovered(&manager.discover_running_servers().await?),
        ServerAction::Add {
            name,
            transport,
            url,
            port,
            command,
            args,
            description,
            working_directory,
            env_vars,
            no_auto_start,
        } => {
            let mut server = match transport {
                TransportType::Sse => ServerConfig::sse(&name, url.unwrap_or_default()),
                TransportType::Stdio => ServerConfig::stdio(&name, command.clone().unwrap_or_default()),
            }
            .with_description(description)
            .with_args(args)
            .with_auto_start(!no_auto_start);
            if let Some(command) = command {
                server = server.with_command(command);
            }
            if let Some(port) = port {
                server = server.with_port(port);
            }
            if let Some(dir) = working_directory {
                server = server.with_working_directory(dir);
            }
            for (key, value) in env_vars {
                server = server.with_env(key, value);
            }
            for hint in server.hints() {
                println!("[WARN] {}", hint);
            }
            manager.add_server(server)?;
            println!("[SUCCESS] Added server {}", name);
        }
        ServerAction::Remove { name } => match manager.remove_server(&name).await {
            Ok(_) => println!("[SUCCESS] Removed server {}", name),
            Err(e) => println!("[WARN] {}", e),
        },
    }

    Ok(())
}

fn print_start(name: &str, outcome: StartOutcome) {
    match outcome {
        StartOutcome::Started { pid } => println!("[SUCCESS] Started {} (PID: {})", name, pid),
        StartOutcome::AlreadyRunning => println!("[INFO] {} is already running", name),
        StartOutcome::StartedUnhealthy { pid } => println!(
            "[WARN] Started {} (PID: {}) but the health check failed",
            name, pid
        ),
    }
}

fn print_stop(name: &str, outcome: StopOutcome) {
    match outcome {
        StopOutcome::Stopped => println!("[SUCCESS] Stopped {}", name),
        StopOutcome::Killed => println!("[WARN] {} did not exit in time and was killed", name),
        StopOutcome::NotManaged => println!("[INFO] {} was not running", name),
    }
}

fn print_discovered(names: &[String]) {
    if names.is_empty() {
        println!("[INFO] No new servers found");
    }
    for name in names {
        println!("[SUCCESS] Discovered {}", name);
    }
}

fn print_reports(reports: &[ServerStatusReport]) {
    if reports.is_empty() {
        println!("No servers configured");
        return;
    }
    println!("{}", "=".repeat(60));
    for r in reports {
        println!("{} [{}] {}", r.name, r.transport_type, r.description);
        println!(
            "    status: {}  health: {}  pid: {}",
            r.status,
            r.health,
            r.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        );
        if let Some(url) = &r.url {
            println!("    url: {}", url);
        }
    }
    println!("{}", "=".repeat(60));
}

const MENU: &str = "
MCP server manager
  1. List servers
  2. Start all servers
  3. Stop all servers
  4. Start a server
  5. Stop a server
  6. Discover running servers
  7. Add a server
  8. Remove a server
  0. Quit";

type InputLines<R> = tokio::io::Lines<R>;

async fn prompt_line<R>(lines: &mut InputLines<R>, prompt: &str) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut out = tokio::io::stdout();
    out.write_all(prompt.as_bytes()).await?;
    out.flush().await?;
    Ok(lines.next_line().await?.map(|l| l.trim().to_string()))
}

async fn run_menu(manager: ServerManager) -> Result<()> {
    let lines = BufReader::new(tokio::io::stdin()).lines();
    run_menu_with(manager, lines, tokio::signal::ctrl_c()).await
}

/// Menu loop over `lines`. `interrupted` cancels whatever step is running,
/// prompts and manager calls alike; every exit path stops the servers.
async fn run_menu_with<R, F, T>(
    mut manager: ServerManager,
    mut lines: InputLines<R>,
    interrupted: F,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = T>,
{
    tokio::pin!(interrupted);

    loop {
        println!("{}", MENU);
        let keep_going = tokio::select! {
            step = menu_step(&mut manager, &mut lines) => step?,
            _ = &mut interrupted => {
                println!();
                false
            }
        };
        if !keep_going {
            break;
        }
    }

    println!("Stopping servers...");
    for (name, result) in manager.stop_all().await {
        match result {
            Ok(outcome) => print_stop(&name, outcome),
            Err(e) => println!("[ERROR] {}", e),
        }
    }
    Ok(())
}

/// One menu choice. `false` ends the loop.
async fn menu_step<R>(manager: &mut ServerManager, lines: &mut InputLines<R>) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    let Some(choice) = prompt_line(lines, "Choice: ").await? else {
        return Ok(false);
    };

    match choice.as_str() {
        "1" => print_reports(&manager.list_servers().await),
        "2" => {
            for (name, result) in manager.start_all().await {
                match result {
                    Ok(outcome) => print_start(&name, outcome),
                    Err(e) => println!("[ERROR] {}", e),
                }
            }
        }
        "3" => {
            for (name, result) in manager.stop_all().await {
                match result {
                    Ok(outcome) => print_stop(&name, outcome),
                    Err(e) => println!("[ERROR] {}", e),
                }
            }
        }
        "4" | "5" => {
            let Some(name) = prompt_line(lines, "Server name: ").await? else {
                return Ok(false);
            };
            if choice == "4" {
                match manager.start_server(&name).await {
                    Ok(outcome) => print_start(&name, outcome),
                    Err(e) => println!("[ERROR] {}", e),
                }
            } else {
                match manager.stop_server(&name).await {
                    Ok(outcome) => print_stop(&name, outcome),
                    Err(e) => println!("[ERROR] {}", e),
                }
            }
        }
        "6" => match manager.discover_running_servers().await {
            Ok(names) => print_discovered(&names),
            Err(e) => println!("[ERROR] {}", e),
        },
        "7" => {
            let Some(server) = prompt_server(lines).await? else {
                return Ok(false);
            };
            let name = server.name.clone();
            match manager.add_server(server) {
                Ok(()) => println!("[SUCCESS] Added server {}", name),
                Err(e) => println!("[ERROR] {}", e),
            }
        }
        "8" => {
            let Some(name) = prompt_line(lines, "Server name: ").await? else {
                return Ok(false);
            };
            match manager.remove_server(&name).await {
                Ok(_) => println!("[SUCCESS] Removed server {}", name),
                Err(e) => println!("[WARN] {}", e),
            }
        }
        "0" | "q" | "quit" => return Ok(false),
        "" => {}
        other => println!("[WARN] Unknown choice: {}", other),
    }
    Ok(true)
}

/// Ask for a new server entry. `None` when input ends.
async fn prompt_server<R>(lines: &mut InputLines<R>) -> Result<Option<ServerConfig>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(name) = prompt_line(lines, "Server name: ").await? else {
        return Ok(None);
    };
    let Some(transport) = prompt_line(lines, "Transport (sse/stdio) [sse]: ").await? else {
        return Ok(None);
    };
    let transport = if transport.is_empty() {
        TransportType::Sse
    } else {
        match transport.parse::<TransportType>() {
            Ok(transport) => transport,
            Err(e) => {
                println!("[WARN] {}, using sse", e);
                TransportType::Sse
            }
        }
    };

    let server = match transport {
        TransportType::Sse => {
            let Some(url) = prompt_line(lines, "SSE url: ").await? else {
                return Ok(None);
            };
            let command = prompt_line(lines, "Start command (empty for none): ")
                .await?
                .filter(|c| !c.is_empty());
            let server = ServerConfig::sse(&name, url);
            match command {
                Some(command) => server.with_command(command),
                None => server.with_auto_start(false),
            }
        }
        TransportType::Stdio => {
            let Some(command) = prompt_line(lines, "Launch command: ").await? else {
                return Ok(None);
            };
            let directory = prompt_line(lines, "Working directory (empty for current): ")
                .await?
                .filter(|d| !d.is_empty());
            let server = ServerConfig::stdio(&name, command);
            match directory {
                Some(directory) => server.with_working_directory(directory),
                None => server,
            }
        }
    };

    let description = prompt_line(lines, "Description: ").await?.unwrap_or_default();
    Ok(Some(server.with_description(description)))
}

async fn run_chat(
    registry_path: &Path,
    config: &AppConfig,
    query: Option<String>,
    allow_no_servers: bool,
) -> Result<()> {
    let registry = match Registry::load(registry_path) {
        Ok(registry) => registry,
        Err(RegistryError::NotFound(path)) => {
            println!("[ERROR] Registry file not found: {}", path.display());
            println!("Run `mcp-stream-cli servers list` to create it.");
            Registry::new()
        }
        Err(e) => return Err(e).context("Failed to load the server registry"),
    };

    let client = McpClient::connect_all(&registry, config.client.request_timeout).await;
    if !client.has_servers() && !allow_no_servers {
        chat::no_servers_guidance(registry_path);
        std::process::exit(1);
    }
    println!("{}", client.list_servers_and_tools());

    let model = OpenAiCompatible::from_settings(&config.llm)?;
    if !model.has_api_key() {
        println!(
            "[WARN] {} is not set; requests to the model will fail",
            config.llm.api_key_env
        );
    }
    println!("[INFO] Using model {} at {}", model.model(), config.llm.base_url);

    let session = ChatSession::new(
        client,
        Arc::new(model),
        ContextLog::create(&config.client.log_file),
    )
    .with_typewriter_delay(config.client.typewriter_delay);

    let result = match query {
        Some(query) => {
            session.process_query(&query).await;
            Ok(())
        }
        None => session.start().await,
    };

    session.client().shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_stream_cli::config::ManagerSettings;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_manager(dir: &TempDir) -> ServerManager {
        let settings = ManagerSettings {
            stop_grace: Duration::from_millis(500),
            ..ManagerSettings::default()
        };
        ServerManager::open(dir.path().join("mcp_servers.json"), settings).unwrap()
    }

    #[tokio::test]
    async fn test_menu_adds_stdio_server() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let path = manager.registry_path().to_path_buf();

        let input = "7\nfiles\nstdio\nnpx -y server-fs /tmp\n/srv/mcp\nFilesystem\n0\n";
        let lines = BufReader::new(input.as_bytes()).lines();
        run_menu_with(manager, lines, std::future::pending::<()>()).await.unwrap();

        let saved = Registry::load(&path).unwrap();
        let files = saved.get("files").unwrap();
        assert_eq!(files.transport_type, TransportType::Stdio);
        assert_eq!(files.command.as_deref(), Some("npx -y server-fs /tmp"));
        assert_eq!(files.working_directory.as_deref(), Some(Path::new("/srv/mcp")));
        assert_eq!(files.description, "Filesystem");
    }

    #[tokio::test]
    async fn test_interrupt_at_any_prompt_stops_servers() {
        let dir = TempDir::new().unwrap();
        let mut manager = open_manager(&dir);
        manager
            .add_server(ServerConfig::stdio("sleepy", "sleep 30"))
            .unwrap();
        manager.start_server("sleepy").await.unwrap();
        let path = manager.registry_path().to_path_buf();

        // Waiting at "Server name:" when the interrupt arrives
        let (mut input, reader) = tokio::io::duplex(64);
        input.write_all(b"5\n").await.unwrap();
        let lines = BufReader::new(reader).lines();
        run_menu_with(manager, lines, tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        let saved = Registry::load(&path).unwrap();
        let sleepy = saved.get("sleepy").unwrap();
        assert_eq!(sleepy.pid, None);
        assert_eq!(sleepy.status, mcp_stream_cli::mcp::ServerStatus::Stopped);
        drop(input);
    }
}
