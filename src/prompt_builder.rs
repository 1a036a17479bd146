use crate::llm::Message;
use crate::mcp::types::{ToolInfo, ToolResult};

/// Base instructions for the assistant
const SYSTEM_INSTRUCTIONS: &str = "You are a helpful assistant with access to tools provided by MCP servers.";

/// How the model has to ask for a tool
const TOOL_USAGE_GUIDE: &str = r#"
Usage guide:
1. Decide whether the request needs a tool.
2. To call tools, reply with exactly this format (several <invoke> elements may share one block):
<function_calls>
<invoke name="TOOL_NAME">
<parameter name="PARAMETER_NAME">VALUE</parameter>
</invoke>
</function_calls>
3. Keep the conversation natural and answer in the user's language.
"#;

/// One line per tool: `- name: description (from server)`, then its
/// parameters with their JSON types
pub fn tool_catalog(tools: &[ToolInfo]) -> String {
    let mut out = String::new();
    for tool in tools {
        out.push_str(&format!(
            "- {}: {} (from {})\n",
            tool.name, tool.description, tool.server_name
        ));
        let params: Vec<String> = tool
            .parameter_names()
            .into_iter()
            .map(|p| format!("{}: {}", p, tool.parameter_type(p).unwrap_or("any")))
            .collect();
        if !params.is_empty() {
            out.push_str(&format!("  parameters: {}\n", params.join(", ")));
        }
    }
    out
}

/// System prompt for the first pass
pub fn build_system_prompt(tools: &[ToolInfo]) -> String {
    let mut prompt = String::new();
    prompt.push_str(SYSTEM_INSTRUCTIONS);
    prompt.push_str("\n\nAvailable tools:\n");
    if tools.is_empty() {
        prompt.push_str("(none)\n");
    } else {
        prompt.push_str(&tool_catalog(tools));
    }
    prompt.push_str(TOOL_USAGE_GUIDE);
    prompt
}

/// System prompt for the second pass that turns tool output into an answer
pub fn build_synthesis_prompt(original_response: &str, results: &[ToolResult]) -> String {
    let mut lines = String::new();
    for result in results {
        lines.push_str(&format!("Tool {} returned: {}\n", result.name, result.output));
    }

    format!(
        "You are a helpful assistant. You have just called tools to answer the user's question.\n\n\
         Original response: {}\n\
         Tool results:\n{}\n\
         Answer the user's original question naturally, in the user's language, based on the tool results. \
         Reflect the returned information accurately and do not add to or alter the data the tools returned.",
        original_response.trim(),
        lines
    )
}

/// Messages for the first pass
pub fn first_pass_messages(tools: &[ToolInfo], user_input: &str) -> Vec<Message> {
    vec![
        Message::system(build_system_prompt(tools)),
        Message::user(user_input),
    ]
}

/// Messages for the synthesis pass
pub fn synthesis_messages(
    user_input: &str,
    original_response: &str,
    results: &[ToolResult],
) -> Vec<Message> {
    vec![
        Message::system(build_synthesis_prompt(original_response, results)),
        Message::user(format!("User question: {}", user_input)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::Tool;
    use serde_json::json;

    fn weather_tool() -> ToolInfo {
        ToolInfo::from_tool(
            &Tool {
                name: "get_weather".to_string(),
                description: Some("Get today's weather for a city".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"city": {"type": "string"}, "days": {"type": "integer"}}
                }),
            },
            "weather_server",
        )
    }

    #[test]
    fn test_tool_catalog() {
        let catalog = tool_catalog(&[weather_tool()]);
        assert_eq!(
            catalog,
            "- get_weather: Get today's weather for a city (from weather_server)\n  parameters: city: string, days: integer\n"
        );
    }

    #[test]
    fn test_system_prompt_contains_format() {
        let prompt = build_system_prompt(&[weather_tool()]);
        assert!(prompt.contains("get_weather"));
        assert!(prompt.contains("<function_calls>"));
        assert!(prompt.contains("<parameter name=\"PARAMETER_NAME\">"));
        assert!(prompt.contains("user's language"));

        assert!(build_system_prompt(&[]).contains("(none)"));
    }

    #[test]
    fn test_synthesis_prompt() {
        let results = vec![
            ToolResult {
                name: "get_weather".to_string(),
                success: true,
                output: "Beijing: sunny today, 25°C, light breeze.".to_string(),
            },
            ToolResult::failure("query_employee", "error: tool query_employee does not exist"),
        ];
        let prompt = build_synthesis_prompt("  checking  ", &results);
        assert!(prompt.contains("Original response: checking\n"));
        assert!(prompt.contains("Tool get_weather returned: Beijing: sunny today, 25°C, light breeze.\n"));
        assert!(prompt.contains("Tool query_employee returned: error: tool query_employee does not exist\n"));

        let messages = synthesis_messages("weather?", "checking", &results);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "User question: weather?");
    }
}
