use anyhow::{Context, Result};
use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal,
};
use serde_json::json;
use std::io::{self, stdout, BufRead, IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::context_log::ContextLog;
use crate::llm::{ChatModel, Message};
use crate::mcp::types::ToolResult;
use crate::mcp::McpClient;
use crate::prompt_builder;
use crate::tool_detector::{contains_tool_calls, ToolCallDetector};

const QUIT_WORDS: [&str; 4] = ["quit", "exit", "q", "退出"];

pub struct ChatSession {
    client: McpClient,
    model: Arc<dyn ChatModel>,
    log: ContextLog,
    typewriter_delay: Duration,
}

impl ChatSession {
    pub fn new(client: McpClient, model: Arc<dyn ChatModel>, log: ContextLog) -> Self {
        Self {
            client,
            model,
            log,
            typewriter_delay: Duration::from_millis(30),
        }
    }

    pub fn with_typewriter_delay(mut self, delay: Duration) -> Self {
        self.typewriter_delay = delay;
        self
    }

    pub fn client(&self) -> &McpClient {
        &self.client
    }

    /// Answer one query: stream a first pass, run the tool calls it asks
    /// for, then stream a second pass over the tool results
    pub async fn process_query(&self, input: &str) -> String {
        self.log.record("1. user input", &json!({ "user_input": input }));

        let tools = self.client.all_tools();
        let messages = prompt_builder::first_pass_messages(tools, input);
        self.log
            .record("1.1 system prompt", &json!({ "system_message": messages[0].content }));
        self.log.record("1.2 available tools", &json!({ "tools": tools }));

        self.type_out("🤔 Thinking...").await;
        let response = match self.stream(&messages).await {
            Ok(text) => text,
            Err(e) => {
                let message = format!("LLM request failed: {:#}", e);
                self.log.record("ERROR", &json!({ "error": message }));
                self.type_out(&format!("❌ {}", message)).await;
                return message;
            }
        };
        self.log.record("2. first response", &json!({ "response": response }));

        if !contains_tool_calls(&response) {
            return response;
        }

        let calls = ToolCallDetector::with_tools(tools).detect(&response);
        self.log.record("3. extracted tool calls", &json!({ "tool_calls": calls }));
        if calls.is_empty() {
            return response;
        }

        for call in &calls {
            self.type_out(&format!("🔧 Calling tool: {}", call.name)).await;
            self.type_out(&format!("   arguments: {}", call.arguments)).await;
        }

        let results = self.client.call_tools(&calls).await;
        let logged: Vec<_> = calls
            .iter()
            .zip(&results)
            .map(|(call, result)| {
                json!({
                    "tool_name": call.name,
                    "arguments": call.arguments,
                    "success": result.success,
                    "result": result.output,
                })
            })
            .collect();
        self.log.record("4. tool results", &json!({ "tool_results": logged }));

        self.type_out("✅ Tool calls complete").await;
        self.type_out("🤔 Combining results...").await;

        let final_result = self.synthesize(input, &response, &results).await;
        self.log
            .record("5. final result", &json!({ "final_result": final_result }));
        final_result
    }

    async fn synthesize(&self, input: &str, response: &str, results: &[ToolResult]) -> String {
        let messages = prompt_builder::synthesis_messages(input, response, results);
        match self.stream(&messages).await {
            Ok(text) => text,
            Err(e) => {
                let message = format!("Failed to process tool results: {:#}", e);
                self.log.record("ERROR", &json!({ "error": message }));
                println!("❌ {}", message);
                message
            }
        }
    }

    /// Print chunks as they arrive
    async fn stream(&self, messages: &[Message]) -> Result<String> {
        let mut on_chunk = |chunk: &str| {
            let mut out = stdout();
            let _ = write!(out, "{}", chunk);
            let _ = out.flush();
        };
        let text = self.model.stream_chat(messages, &mut on_chunk).await?;
        println!();
        Ok(text)
    }

    /// Typewriter effect for status lines
    async fn type_out(&self, message: &str) {
        let mut out = stdout();
        for c in message.chars() {
            let _ = write!(out, "{}", c);
            let _ = out.flush();
            if !self.typewriter_delay.is_zero() {
                tokio::time::sleep(self.typewriter_delay).await;
            }
        }
        println!();
    }

    /// Interactive loop until quit, Ctrl+C or Ctrl+D
    pub async fn start(&self) -> Result<()> {
        self.print_banner();

        if !io::stdin().is_terminal() {
            return self.run_piped_loop().await;
        }

        let mut stdout = stdout();
        loop {
            self.print_separator();
            execute!(stdout, Print("> "))?;

            terminal::enable_raw_mode().context("Failed to enable raw mode")?;
            let input = self.read_multiline_input(&mut stdout);
            terminal::disable_raw_mode().context("Failed to disable raw mode")?;

            let input = match input? {
                Some(text) => text,
                None => break, // User pressed Ctrl+C or Ctrl+D
            };

            if !self.handle_input(&input).await {
                break;
            }
        }

        println!();
        Ok(())
    }

    // Line-based fallback when stdin is not a terminal
    async fn run_piped_loop(&self) -> Result<()> {
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            self.print_separator();
            print!("> ");
            io::stdout().flush()?;

            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            if !self.handle_input(&line).await {
                break;
            }
        }
        Ok(())
    }

    /// Returns `false` when the user asked to leave
    async fn handle_input(&self, input: &str) -> bool {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return true;
        }
        if is_quit(trimmed) {
            println!("Goodbye!");
            return false;
        }

        println!();
        self.process_query(trimmed).await;
        true
    }

    fn read_multiline_input(&self, stdout: &mut io::Stdout) -> Result<Option<String>> {
        let mut buffer = String::new();
        let mut current_line = 0; // Track which line we're currently on (0-indexed)

        loop {
            if !event::poll(Duration::from_millis(100))? {
                continue;
            }
            let Event::Key(key_event) = event::read()? else {
                continue;
            };

            match key_event {
                // Ctrl+C or Ctrl+D to exit
                KeyEvent {
                    code: KeyCode::Char('c') | KeyCode::Char('d'),
                    modifiers: KeyModifiers::CONTROL,
                    ..
                } => {
                    return Ok(None);
                }

                // Shift+Enter (detected as Ctrl+J) for newline
                KeyEvent {
                    code: KeyCode::Char('j'),
                    modifiers: KeyModifiers::CONTROL,
                    ..
                } => {
                    buffer.push('\n');
                    execute!(stdout, Print("\r\n  "))?;
                    current_line += 1;
                }

                // Enter to submit
                KeyEvent {
                    code: KeyCode::Enter,
                    ..
                } => {
                    execute!(stdout, Print("\r\n"))?;
                    return Ok(Some(buffer));
                }

                KeyEvent {
                    code: KeyCode::Backspace,
                    ..
                } => {
                    if buffer.pop().is_some() {
                        self.redraw_buffer(stdout, &buffer, current_line)?;
                        current_line = buffer.chars().filter(|&c| c == '\n').count();
                    }
                }

                KeyEvent {
                    code: KeyCode::Char(c),
                    modifiers: KeyModifiers::NONE | KeyModifiers::SHIFT,
                    ..
                } => {
                    buffer.push(c);
                    execute!(stdout, Print(c))?;
                }

                _ => {}
            }
            stdout.flush()?;
        }
    }

    fn redraw_buffer(&self, stdout: &mut io::Stdout, buffer: &str, from_line: usize) -> Result<()> {
        // Back to the prompt line
        if from_line > 0 {
            execute!(stdout, cursor::MoveUp(from_line as u16))?;
        }

        execute!(
            stdout,
            Print("\r"),
            terminal::Clear(terminal::ClearType::FromCursorDown),
            Print("> ")
        )?;

        for c in buffer.chars() {
            if c == '\n' {
                execute!(stdout, Print("\r\n  "))?;
            } else {
                execute!(stdout, Print(c))?;
            }
        }

        Ok(())
    }

    fn print_banner(&self) {
        let cyan = Color::Rgb { r: 135, g: 206, b: 235 };
        let tools = self.client.all_tools().len();
        let servers = self.client.server_count();

        print!("{}", SetForegroundColor(cyan));
        print!("▗ ████████ ▖");
        print!("{}", ResetColor);
        println!(" MCP Stream Chat");

        print!(" ");
        print!("{}", SetForegroundColor(cyan));
        print!("▚█▙████▟█▞");
        print!("{}", ResetColor);
        println!("  {} server(s), {} tool(s) available.", servers, tools);

        print!("  ");
        print!("{}", SetForegroundColor(cyan));
        print!("████████");
        print!("{}", ResetColor);
        println!("   Use Shift+Enter for new lines.");

        print!("  ");
        print!("{}", SetForegroundColor(cyan));
        print!("▜      ▛");
        print!("{}", ResetColor);
        println!("   Type 'quit' or press Ctrl+C to leave.\n");
    }

    fn print_separator(&self) {
        let width = terminal::size().map(|(cols, _)| cols as usize).unwrap_or(80);

        print!("{}", SetForegroundColor(Color::Rgb { r: 100, g: 149, b: 237 }));
        println!("{}", "─".repeat(width));
        print!("{}", ResetColor);
    }
}

fn is_quit(input: &str) -> bool {
    QUIT_WORDS.iter().any(|w| input.eq_ignore_ascii_case(w))
}

/// Shown when no server could be loaded
pub fn no_servers_guidance(registry_path: &std::path::Path) {
    println!("[ERROR] No MCP server could be loaded from {}", registry_path.display());
    println!("Start servers first:");
    println!("  mcp-stream-cli servers start-all");
    println!("or discover running ones:");
    println!("  mcp-stream-cli servers discover");
    println!("Use --allow-no-servers to chat without tools.");
    warn!("no MCP servers available");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::mcp::registry::{Registry, ServerConfig, ServerStatus};
    use crate::test_support::FakeSseServer;
    use std::fs;

    async fn demo_client(server: &FakeSseServer) -> McpClient {
        let mut registry = Registry::new();
        registry.upsert(ServerConfig::sse("demo", server.sse_url()).with_status(ServerStatus::Running));
        McpClient::connect_all(&registry, Duration::from_secs(5)).await
    }

    fn session(client: McpClient, model: Arc<ScriptedModel>, log: ContextLog) -> ChatSession {
        ChatSession::new(client, model, log).with_typewriter_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_plain_answer_skips_tools() {
        let model = Arc::new(ScriptedModel::new(["Hello! How can I help?"]));
        let chat = session(McpClient::from_connections(Vec::new()), model.clone(), ContextLog::disabled());

        let answer = chat.process_query("hi").await;
        assert_eq!(answer, "Hello! How can I help?");

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0][0].content.contains("(none)"));
        assert_eq!(seen[0][1], Message::user("hi"));
    }

    #[tokio::test]
    async fn test_tool_calls_feed_second_pass() {
        let server = FakeSseServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("debug.log");

        let first = r#"Let me look that up.
<function_calls>
<invoke name="query_employee">
<parameter name="employee_id">D0005</parameter>
</invoke>
<invoke name="get_employee_location">
<parameter name="employee_id">D0005</parameter>
</invoke>
</function_calls>"#;
        let model = Arc::new(ScriptedModel::new([first, "D0005 is in Shanghai."]));
        let chat = session(demo_client(&server).await, model.clone(), ContextLog::create(&log_path));

        let answer = chat.process_query("Where is D0005 and what is their name?").await;
        assert_eq!(answer, "D0005 is in Shanghai.");

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0][0].content.contains("get_employee_location"));
        let synthesis = &seen[1][0].content;
        assert!(synthesis.contains("Tool query_employee returned: Employee D0005 is"));
        assert!(synthesis.contains(
            "Tool get_employee_location returned: Employee D0005 is currently at Shanghai HQ"
        ));
        assert_eq!(
            seen[1][1].content,
            "User question: Where is D0005 and what is their name?"
        );

        let log = fs::read_to_string(&log_path).unwrap();
        for step in ["1. user input", "2. first response", "3. extracted tool calls", "4. tool results", "5. final result"] {
            assert!(log.contains(step), "missing step {step}");
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_to_model() {
        let first = r#"<function_calls><invoke name="get_stock"><parameter name="symbol">ACME</parameter></invoke></function_calls>"#;
        let model = Arc::new(ScriptedModel::new([first, "Sorry, no stock tool."]));
        let chat = session(McpClient::from_connections(Vec::new()), model.clone(), ContextLog::disabled());

        let answer = chat.process_query("ACME price?").await;
        assert_eq!(answer, "Sorry, no stock tool.");
        let seen = model.seen.lock().unwrap();
        assert!(seen[1][0]
            .content
            .contains("Tool get_stock returned: error: tool get_stock does not exist"));
    }

    #[tokio::test]
    async fn test_llm_failure_is_returned_as_text() {
        let model = Arc::new(ScriptedModel::failing("boom"));
        let chat = session(McpClient::from_connections(Vec::new()), model, ContextLog::disabled());

        let answer = chat.process_query("hi").await;
        assert_eq!(answer, "LLM request failed: stream interrupted: boom");
    }

    #[test]
    fn test_quit_words() {
        assert!(is_quit("quit"));
        assert!(is_quit("EXIT"));
        assert!(is_quit("Q"));
        assert!(is_quit("退出"));
        assert!(!is_quit("question"));
    }
}
