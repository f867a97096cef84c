//! MCP server exposing plugin commands as tools
//!
//! Each command of an available plugin becomes one tool named
//! `<namespace>_<command>`. The server lives only as long as the session
//! whose credentials it was bound to.

pub mod protocol;
pub mod server;

pub use server::McpServer;

/// Tool name for a plugin command
pub fn tool_name(namespace: &str, command: &str) -> String {
    format!("{}_{}", namespace, command)
}

/// Split a tool name at the first underscore
pub fn parse_tool_name(name: &str) -> Option<(&str, &str)> {
    let (namespace, command) = name.split_once('_')?;
    (!namespace.is_empty() && !command.is_empty()).then_some((namespace, command))
}
