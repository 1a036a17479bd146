// Multi-server MCP client with a streaming LLM front end, plus a manager
// for the MCP servers it talks to.

pub mod chat;
pub mod config;
pub mod context_log;
pub mod demo_server;
pub mod llm;
pub mod manager;
pub mod mcp;
pub mod prompt_builder;
pub mod sse;
pub mod tool_detector;

#[cfg(test)]
mod test_support;
