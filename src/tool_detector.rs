// Tool call detection from LLM output

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Number, Value};
use std::collections::HashMap;

use crate::mcp::types::{ToolCall, ToolInfo};

pub const BLOCK_OPEN: &str = "<function_calls>";
pub const BLOCK_CLOSE: &str = "</function_calls>";

static BLOCK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<function_calls>(.*?)</function_calls>").unwrap());

static INVOKE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<invoke\s+name="([^"]+)"\s*>(.*?)</invoke>"#).unwrap());

static PARAMETER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<parameter\s+name="([^"]+)"\s*>(.*?)</parameter>"#).unwrap()
});

/// Whether the text holds a complete tool call block
pub fn contains_tool_calls(text: &str) -> bool {
    text.contains(BLOCK_OPEN) && text.contains(BLOCK_CLOSE)
}

/// Tool call detector that extracts tool calls from LLM output
#[derive(Debug, Default)]
pub struct ToolCallDetector {
    // tool name -> parameter name -> declared JSON type
    schemas: HashMap<String, HashMap<String, String>>,
}

impl ToolCallDetector {
    /// Create a detector that keeps every parameter as a string
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detector that converts parameters to the types the tools
    /// declare in their input schemas
    pub fn with_tools(tools: &[ToolInfo]) -> Self {
        let schemas = tools
            .iter()
            .map(|tool| {
                let types = tool
                    .parameter_names()
                    .into_iter()
                    .filter_map(|param| {
                        tool.parameter_type(param)
                            .map(|ty| (param.to_string(), ty.to_string()))
                    })
                    .collect();
                (tool.name.clone(), types)
            })
            .collect();
        Self { schemas }
    }

    /// Detect tool calls from text, in the order they appear
    pub fn detect(&self, text: &str) -> Vec<ToolCall> {
        let mut calls = Vec::new();

        for block in BLOCK_PATTERN.captures_iter(text) {
            for invoke in INVOKE_PATTERN.captures_iter(&block[1]) {
                let name = invoke[1].trim().to_string();
                let types = self.schemas.get(&name);

                let mut args = serde_json::Map::new();
                for param in PARAMETER_PATTERN.captures_iter(&invoke[2]) {
                    let param_name = param[1].trim().to_string();
                    let raw = param[2].trim();
                    let declared = types.and_then(|t| t.get(&param_name)).map(String::as_str);
                    args.insert(param_name, coerce(raw, declared));
                }

                calls.push(ToolCall {
                    name,
                    arguments: Value::Object(args),
                });
            }
        }

        calls
    }
}

/// Convert a raw parameter value to the declared type, falling back to the
/// string when it does not parse
fn coerce(raw: &str, declared: Option<&str>) -> Value {
    let converted = match declared {
        Some("integer") => raw.parse::<i64>().ok().map(Value::from),
        Some("number") => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        Some("boolean") => match raw.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        Some("object") => serde_json::from_str::<Value>(raw).ok().filter(Value::is_object),
        Some("array") => serde_json::from_str::<Value>(raw).ok().filter(Value::is_array),
        _ => None,
    };
    converted.unwrap_or_else(|| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::Tool;
    use serde_json::json;

    fn tool(name: &str, schema: Value) -> ToolInfo {
        ToolInfo::from_tool(
            &Tool {
                name: name.to_string(),
                description: None,
                input_schema: schema,
            },
            "test_server",
        )
    }

    #[test]
    fn test_detect_single_call() {
        let detector = ToolCallDetector::new();

        let text = r#"
Let me check the weather for you.

<function_calls>
<invoke name="get_weather">
<parameter name="city">
  Tokyo
</parameter>
</invoke>
</function_calls>
"#;

        let calls = detector.detect(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, json!({"city": "Tokyo"}));
    }

    #[test]
    fn test_detect_every_invoke_in_a_block() {
        let detector = ToolCallDetector::new();

        let text = r#"<function_calls>
<invoke name="query_employee">
<parameter name="employee_id">D0005</parameter>
</invoke>
<invoke name="get_employee_location">
<parameter name="employee_id">D0005</parameter>
</invoke>
</function_calls>"#;

        let calls = detector.detect(text);
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["query_employee", "get_employee_location"]);
    }

    #[test]
    fn test_detect_multiple_blocks() {
        let detector = ToolCallDetector::new();

        let text = r#"
First the weather:
<function_calls><invoke name="get_weather"><parameter name="city">Beijing</parameter></invoke></function_calls>
Then the staff:
<function_calls><invoke name="list_employees"></invoke></function_calls>
"#;

        let calls = detector.detect(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[1].name, "list_employees");
        assert_eq!(calls[1].arguments, json!({}));
    }

    #[test]
    fn test_schema_types_are_applied() {
        let tools = vec![tool(
            "search",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer"},
                    "ratio": {"type": "number"},
                    "exact": {"type": "boolean"},
                    "filters": {"type": "object"},
                    "tags": {"type": "array"}
                }
            }),
        )];
        let detector = ToolCallDetector::with_tools(&tools);

        let text = r#"<function_calls>
<invoke name="search">
<parameter name="query">42</parameter>
<parameter name="limit">10</parameter>
<parameter name="ratio">0.5</parameter>
<parameter name="exact">True</parameter>
<parameter name="filters">{"lang": "en"}</parameter>
<parameter name="tags">["a", "b"]</parameter>
</invoke>
</function_calls>"#;

        let calls = detector.detect(text);
        assert_eq!(
            calls[0].arguments,
            json!({
                "query": "42",
                "limit": 10,
                "ratio": 0.5,
                "exact": true,
                "filters": {"lang": "en"},
                "tags": ["a", "b"]
            })
        );
    }

    #[test]
    fn test_unparseable_values_stay_strings() {
        let tools = vec![tool(
            "search",
            json!({"properties": {"limit": {"type": "integer"}, "tags": {"type": "array"}}}),
        )];
        let detector = ToolCallDetector::with_tools(&tools);

        let text = r#"<function_calls><invoke name="search">
<parameter name="limit">ten</parameter>
<parameter name="tags">{"not": "an array"}</parameter>
</invoke></function_calls>"#;

        let calls = detector.detect(text);
        assert_eq!(calls[0].arguments["limit"], "ten");
        assert_eq!(calls[0].arguments["tags"], r#"{"not": "an array"}"#);
    }

    #[test]
    fn test_no_tool_calls() {
        let detector = ToolCallDetector::new();

        let text = "This is just regular text without any tool calls.";
        assert!(!contains_tool_calls(text));
        assert!(detector.detect(text).is_empty());

        // An unterminated block is not a call
        let partial = "<function_calls><invoke name=\"get_weather\">";
        assert!(!contains_tool_calls(partial));
        assert!(detector.detect(partial).is_empty());
    }
}
