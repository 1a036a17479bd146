use serde_json::json;
use std::time::Duration;

use mcp_stream_cli::mcp::registry::{Registry, ServerConfig};
use mcp_stream_cli::mcp::types::ToolCall;
use mcp_stream_cli::mcp::McpClient;

const TIMEOUT: Duration = Duration::from_secs(10);

fn demo_server(name: &str) -> ServerConfig {
    ServerConfig::stdio(name, env!("CARGO_BIN_EXE_mcp-stream-cli"))
        .with_args(["demo-server"])
        .with_description("built-in demo server")
}

#[tokio::test]
async fn client_talks_to_demo_server_over_stdio() {
    let mut registry = Registry::new();
    registry.upsert(demo_server("demo"));

    let client = McpClient::connect_all(&registry, TIMEOUT).await;
    assert_eq!(client.server_count(), 1);

    let names: Vec<&str> = client.all_tools().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["get_weather", "query_employee", "list_employees", "get_employee_location"]
    );

    let weather = client.call_tool("get_weather", json!({"city": "Beijing"})).await;
    assert!(weather.success);
    assert_eq!(weather.output, "Beijing: sunny today, 25°C, light breeze.");

    let missing_city = client.call_tool("get_weather", json!({})).await;
    assert!(!missing_city.success);

    let results = client
        .call_tools(&[
            ToolCall {
                name: "query_employee".to_string(),
                arguments: json!({"employee_id": "D0005"}),
            },
            ToolCall {
                name: "get_employee_location".to_string(),
                arguments: json!({"employee_id": "D0005"}),
            },
            ToolCall {
                name: "list_employees".to_string(),
                arguments: json!({"department": "Sales"}),
            },
        ])
        .await;
    assert!(results.iter().all(|r| r.success));
    assert!(results[0].output.starts_with("Employee D0005 is "));
    assert!(results[1].output.contains("Shanghai HQ"));
    assert_eq!(results[2].output.lines().filter(|l| l.starts_with("- ")).count(), 3);

    client.shutdown().await;
}

#[tokio::test]
async fn duplicate_tools_are_routed_by_qualified_name() {
    let mut registry = Registry::new();
    registry.upsert(demo_server("first"));
    registry.upsert(demo_server("second"));

    let client = McpClient::connect_all(&registry, TIMEOUT).await;
    assert_eq!(client.server_count(), 2);
    assert_eq!(client.all_tools().len(), 8);

    assert_eq!(client.tool("get_weather").unwrap().server_name, "first");
    assert_eq!(client.tool("second.get_weather").unwrap().server_name, "second");

    let result = client
        .call_tool("second.get_weather", json!({"city": "Chengdu"}))
        .await;
    assert!(result.success);
    assert!(result.output.starts_with("Chengdu"));

    assert!(client.list_servers_and_tools().contains("second.get_weather"));
    client.shutdown().await;
}
