// Built-in demo MCP server.
//
// Speaks newline-delimited JSON-RPC on stdin/stdout and exposes a weather
// tool plus a small employee directory, so the client can be tried without
// any external server. Nothing but JSON-RPC may be written to stdout.

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::mcp::types::{
    CallToolParams, CallToolResult, Implementation, InitializeResult, JsonRpcError,
    JsonRpcResponse, ListToolsResult, RequestId, ServerCapabilities, Tool, ToolsCapability,
    PROTOCOL_VERSION,
};

const DEPARTMENTS: [&str; 4] = ["Engineering", "Sales", "HR", "Finance"];

const LOCATIONS: [(&str, &str); 5] = [
    ("D0001", "Beijing HQ, Building A, 3F meeting room"),
    ("D0002", "Chengdu branch, 2F office"),
    ("D0003", "New York office, 1F reception"),
    ("D0004", "Shenzhen R&D center, 4F lab"),
    ("D0005", "Shanghai HQ, Building B, 5F desk"),
];

/// Tool catalog advertised by `tools/list`
pub fn tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "get_weather".to_string(),
            description: Some("Get today's weather for a city".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            }),
        },
        Tool {
            name: "query_employee".to_string(),
            description: Some("Look up an employee's name by employee id".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": { "employee_id": { "type": "string" } },
                "required": ["employee_id"]
            }),
        },
        Tool {
            name: "list_employees".to_string(),
            description: Some("List employees, optionally filtered by department".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": { "department": { "type": "string" } }
            }),
        },
        Tool {
            name: "get_employee_location".to_string(),
            description: Some("Get the current location of an employee".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": { "employee_id": { "type": "string" } },
                "required": ["employee_id"]
            }),
        },
    ]
}

/// Handle one incoming line. Returns the serialized response, or `None` for
/// notifications.
pub fn handle_line(line: &str) -> Option<String> {
    let response = match serde_json::from_str::<Value>(line) {
        Ok(message) => handle_message(&message)?,
        Err(e) => JsonRpcResponse::failure(
            RequestId::Null,
            JsonRpcError::new(JsonRpcError::PARSE_ERROR, format!("Parse error: {}", e)),
        ),
    };

    match serde_json::to_string(&response) {
        Ok(json) => Some(json),
        Err(e) => {
            debug!("failed to serialize response: {}", e);
            None
        }
    }
}

fn handle_message(message: &Value) -> Option<JsonRpcResponse> {
    let method = message.get("method").and_then(Value::as_str);
    let id = message
        .get("id")
        .cloned()
        .map(serde_json::from_value::<RequestId>);

    let id = match (method, id) {
        // Notification
        (Some(_), None) => return None,
        (_, Some(Ok(id))) => id,
        _ => {
            return Some(JsonRpcResponse::failure(
                RequestId::Null,
                JsonRpcError::new(JsonRpcError::INVALID_REQUEST, "Invalid Request"),
            ));
        }
    };

    let Some(method) = method else {
        return Some(JsonRpcResponse::failure(
            id,
            JsonRpcError::new(JsonRpcError::INVALID_REQUEST, "Missing method"),
        ));
    };

    let params = message.get("params").cloned().unwrap_or(Value::Null);
    let result = match method {
        "initialize" => serde_json::to_value(InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            server_info: Implementation::current(),
            instructions: None,
        })
        .map_err(internal),
        "ping" => Ok(json!({})),
        "tools/list" => serde_json::to_value(ListToolsResult {
            tools: tools(),
            next_cursor: None,
        })
        .map_err(internal),
        "tools/call" => serde_json::from_value::<CallToolParams>(params)
            .map_err(|e| {
                JsonRpcError::new(JsonRpcError::INVALID_PARAMS, format!("Invalid params: {}", e))
            })
            .and_then(|call| {
                let args = call.arguments.unwrap_or_else(|| json!({}));
                call_tool(&call.name, &args)
            })
            .and_then(|r| serde_json::to_value(r).map_err(internal)),
        other => Err(JsonRpcError::new(
            JsonRpcError::METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        )),
    };

    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(error) => JsonRpcResponse::failure(id, error),
    })
}

fn internal(e: serde_json::Error) -> JsonRpcError {
    JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string())
}

fn string_arg<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str).map(str::trim)
}

/// Execute a demo tool. Unknown tools are a protocol error; bad input is a
/// tool-level error result.
pub fn call_tool(name: &str, args: &Value) -> Result<CallToolResult, JsonRpcError> {
    let result = match name {
        "get_weather" => match string_arg(args, "city").filter(|c| !c.is_empty()) {
            Some(city) => CallToolResult::text(format!("{}: sunny today, 25°C, light breeze.", city)),
            None => CallToolResult::error("error: please provide a city"),
        },
        "query_employee" => match string_arg(args, "employee_id").filter(|id| !id.is_empty()) {
            Some(id) => {
                let name = random_name();
                CallToolResult::text(format!(
                    "Employee {id} is {name}\n\nEmployee record:\n- ID: {id}\n- Name: {name}\n- Department: unassigned\n- Status: active"
                ))
            }
            None => CallToolResult::error("error: please provide an employee id"),
        },
        "list_employees" => {
            let filter = string_arg(args, "department").filter(|d| !d.is_empty());
            CallToolResult::text(list_employees(filter))
        }
        "get_employee_location" => {
            let id = string_arg(args, "employee_id").unwrap_or_default();
            CallToolResult::text(employee_location(id))
        }
        other => {
            return Err(JsonRpcError::new(
                JsonRpcError::INVALID_PARAMS,
                format!("Unknown tool: {}", other),
            ));
        }
    };
    Ok(result)
}

/// Two or three random CJK unified ideographs
fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(2..=3);
    (0..len)
        .filter_map(|_| char::from_u32(rng.gen_range(0x4E00..0x9FFF)))
        .collect()
}

fn list_employees(department: Option<&str>) -> String {
    let departments: Vec<&str> = match department {
        Some(d) if DEPARTMENTS.contains(&d) => vec![d],
        _ => DEPARTMENTS.to_vec(),
    };

    let mut rng = rand::thread_rng();
    let mut out = format!(
        "Employees (department: {})\n\n",
        department.unwrap_or("all")
    );
    for dept in departments {
        for _ in 0..3 {
            let id = format!("{}{}", &dept[..2], rng.gen_range(1000..=9999));
            out.push_str(&format!("- {} | {} | {} | active\n", id, random_name(), dept));
        }
    }
    out
}

fn employee_location(id: &str) -> String {
    match LOCATIONS.iter().find(|(known, _)| *known == id) {
        Some((_, location)) => format!("Employee {} is currently at {}.", id, location),
        None => {
            let known: Vec<String> = LOCATIONS
                .iter()
                .map(|(k, loc)| format!("{} ({})", k, loc))
                .collect();
            format!(
                "No location found for employee {}. Known ids: {}",
                id,
                known.join(", ")
            )
        }
    }
}

/// Serve JSON-RPC on stdin/stdout until stdin closes
pub async fn run_stdio() -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handle_line(&line) {
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(line: &str) -> Value {
        serde_json::from_str(&handle_line(line).unwrap()).unwrap()
    }

    #[test]
    fn test_initialize() {
        let resp = call(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#);
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], "mcp-stream-cli");
    }

    #[test]
    fn test_notification_has_no_response() {
        assert!(handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).is_none());
    }

    #[test]
    fn test_parse_error_and_unknown_method() {
        let resp = call("not json");
        assert_eq!(resp["error"]["code"], JsonRpcError::PARSE_ERROR);
        assert!(resp["id"].is_null());

        let resp = call(r#"{"jsonrpc":"2.0","id":"x","method":"resources/list"}"#);
        assert_eq!(resp["id"], "x");
        assert_eq!(resp["error"]["code"], JsonRpcError::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_tools_list() {
        let resp = call(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list","params":{}}"#);
        let names: Vec<&str> = resp["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["get_weather", "query_employee", "list_employees", "get_employee_location"]
        );
    }

    #[test]
    fn test_weather_and_location() {
        let weather = call_tool("get_weather", &json!({"city": "Beijing"})).unwrap();
        let weather = crate::mcp::types::ToolResult::from(weather);
        assert_eq!(weather.output, "Beijing: sunny today, 25°C, light breeze.");

        let known = employee_location("D0005");
        assert!(known.contains("Shanghai HQ"));
        let unknown = employee_location("D9999");
        assert!(unknown.starts_with("No location found for employee D9999"));
        assert!(unknown.contains("D0001"));
    }

    #[test]
    fn test_query_employee_name_is_cjk() {
        let result = call_tool("query_employee", &json!({"employee_id": "D0001"})).unwrap();
        assert!(result.is_error.is_none());

        let name = random_name();
        let count = name.chars().count();
        assert!((2..=3).contains(&count));
        assert!(name.chars().all(|c| ('\u{4E00}'..'\u{9FFF}').contains(&c)));

        let missing = call_tool("query_employee", &json!({})).unwrap();
        assert_eq!(missing.is_error, Some(true));
    }

    #[test]
    fn test_list_employees_filter() {
        let all = list_employees(None);
        assert_eq!(all.lines().filter(|l| l.starts_with("- ")).count(), 12);

        let sales = list_employees(Some("Sales"));
        let rows: Vec<&str> = sales.lines().filter(|l| l.starts_with("- ")).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.starts_with("- Sa") && r.contains("| Sales |")));
    }

    #[test]
    fn test_unknown_tool_is_invalid_params() {
        let resp = call(
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"nope","arguments":{}}}"#,
        );
        assert_eq!(resp["error"]["code"], JsonRpcError::INVALID_PARAMS);
    }
}
