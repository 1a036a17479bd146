use std::path::Path;
use std::process::{Command, Output};

use mcp_stream_cli::mcp::registry::{Registry, TransportType};

fn run(registry: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mcp-stream-cli"))
        .arg("--registry")
        .arg(registry)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .unwrap()
}

#[test]
fn add_list_and_remove_servers() {
    let dir = tempfile::tempdir().unwrap();
    let registry = dir.path().join("mcp_servers.json");

    let out = run(
        &registry,
        &[
            "servers", "add", "employees",
            "--transport", "stdio",
            "--command", "python",
            "--arg", "employee_server.py",
            "--env", "LOG_LEVEL=debug",
            "--description", "Employee directory",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    // Default entry is created alongside the new one
    let saved = Registry::load(&registry).unwrap();
    assert!(saved.contains("weather_server"));
    let entry = saved.get("employees").unwrap();
    assert_eq!(entry.transport_type, TransportType::Stdio);
    assert_eq!(entry.command.as_deref(), Some("python"));
    assert_eq!(entry.args, vec!["employee_server.py"]);
    assert_eq!(entry.env_vars.get("LOG_LEVEL").map(String::as_str), Some("debug"));

    let out = run(&registry, &["servers", "list"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(out.status.success());
    assert!(stdout.contains("employees [stdio] Employee directory"));

    let out = run(&registry, &["servers", "remove", "employees"]);
    assert!(out.status.success());
    assert!(!Registry::load(&registry).unwrap().contains("employees"));
}

#[test]
fn duplicate_port_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = dir.path().join("mcp_servers.json");

    // weather_server owns port 8000 in the default registry
    let out = run(
        &registry,
        &["servers", "add", "clash", "--url", "http://127.0.0.1:8000/sse", "--port", "8000"],
    );
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("port 8000"));
}

#[test]
fn chat_without_servers_exits_with_guidance() {
    let dir = tempfile::tempdir().unwrap();
    let registry = dir.path().join("missing.json");

    let out = run(&registry, &["chat", "--query", "hello"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stdout).contains("No MCP server could be loaded"));
}
