//! MCP server
//!
//! Handles the MCP protocol over stdio, one JSON-RPC 2.0 message per line.

use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use super::protocol::{
    CallToolParams, InitializeResult, InputSchema, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, ServerCapabilities, ServerInfo, Tool, ToolResult, ToolsCapability,
    INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};
use super::{parse_tool_name, tool_name};
use crate::plugin::{BoundRegistry, CommandSpec};

/// MCP server bound to one session's plugins
pub struct McpServer<'a> {
    plugins: BoundRegistry<'a>,
    initialized: bool,
}

impl<'a> McpServer<'a> {
    pub fn new(plugins: BoundRegistry<'a>) -> Self {
        Self {
            plugins,
            initialized: false,
        }
    }

    /// Whether the client has sent `notifications/initialized`
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Serve on stdin/stdout until the client disconnects
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.serve(stdin, stdout).await
    }

    pub async fn serve<R, W>(&mut self, mut reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                info!("Client disconnected");
                break;
            }

            let message = line.trim();
            if message.is_empty() {
                continue;
            }

            debug!("Received: {}", message);

            if let Some(response) = self.handle_message(message) {
                let encoded = serde_json::to_string(&response)?;
                writer.write_all(encoded.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }

        Ok(())
    }

    /// Handle one JSON-RPC message; notifications get no response
    pub fn handle_message(&mut self, message: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                return Some(JsonRpcResponse::error(
                    None,
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                ));
            }
        };

        let Some(id) = request.id else {
            self.handle_notification(&request.method);
            return None;
        };

        match self.handle_request(&request.method, request.params) {
            Ok(value) => Some(JsonRpcResponse::success(Some(id), value)),
            Err((code, message)) => Some(JsonRpcResponse::error(Some(id), code, message)),
        }
    }

    fn handle_notification(&mut self, method: &str) {
        match method {
            "notifications/initialized" => {
                info!("Client initialized");
                self.initialized = true;
            }
            _ => debug!("Ignoring notification: {}", method),
        }
    }

    fn handle_request(&mut self, method: &str, params: Option<Value>) -> Result<Value, (i32, String)> {
        match method {
            "initialize" => self.handle_initialize(),
            "tools/list" => self.handle_list_tools(),
            "tools/call" => self.handle_call_tool(params),
            "ping" => Ok(json!({})),
            _ => {
                warn!("Unknown method: {}", method);
                Err((METHOD_NOT_FOUND, format!("Method not found: {}", method)))
            }
        }
    }

    fn handle_initialize(&self) -> Result<Value, (i32, String)> {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability::default(),
            },
            server_info: ServerInfo {
                name: "nakimi".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        to_value(result)
    }

    /// Tools for every command of every available plugin
    pub fn tools(&self) -> Vec<Tool> {
        self.plugins
            .commands()
            .into_iter()
            .map(|(plugin, command)| Tool {
                name: tool_name(plugin.namespace(), command.name),
                description: format!("{}: {}", plugin.description(), command.description),
                input_schema: input_schema(command),
            })
            .collect()
    }

    fn handle_list_tools(&self) -> Result<Value, (i32, String)> {
        to_value(ListToolsResult {
            tools: self.tools(),
        })
    }

    fn handle_call_tool(&self, params: Option<Value>) -> Result<Value, (i32, String)> {
        let params: CallToolParams = match params {
            Some(p) => serde_json::from_value(p)
                .map_err(|e| (INVALID_PARAMS, format!("Invalid params: {}", e)))?,
            None => return Err((INVALID_PARAMS, "Missing params".to_string())),
        };

        info!("Calling tool: {}", params.name);

        let result = match parse_tool_name(&params.name) {
            Some((namespace, command)) => {
                let args = positional_args(self.command_spec(namespace, command), &params.arguments);
                match self.plugins.dispatch(namespace, command, &args) {
                    Ok(output) => ToolResult::success(output),
                    Err(e) => ToolResult::error(e.to_string()),
                }
            }
            None => ToolResult::error(format!("Unknown tool: {}", params.name)),
        };

        to_value(result)
    }

    fn command_spec(&self, namespace: &str, command: &str) -> Option<&'static CommandSpec> {
        self.plugins
            .commands()
            .into_iter()
            .find(|(p, c)| p.namespace() == namespace && c.name == command)
            .map(|(_, c)| c)
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, (i32, String)> {
    serde_json::to_value(value).map_err(|e| (INTERNAL_ERROR, format!("Serialization error: {}", e)))
}

fn input_schema(command: &CommandSpec) -> InputSchema {
    let properties = command
        .args
        .iter()
        .map(|arg| {
            (
                arg.name.to_string(),
                json!({"type": "string", "description": arg.help}),
            )
        })
        .collect();

    InputSchema {
        schema_type: "object".to_string(),
        properties,
        required: command
            .args
            .iter()
            .filter(|a| a.required)
            .map(|a| a.name.to_string())
            .collect(),
    }
}

/// Named tool arguments in declaration order, up to the first one missing
fn positional_args(spec: Option<&CommandSpec>, arguments: &Map<String, Value>) -> Vec<String> {
    let Some(spec) = spec else {
        return Vec::new();
    };

    spec.args
        .iter()
        .map_while(|arg| arguments.get(arg.name))
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{CredentialMap, PluginRegistry};

    fn credentials() -> CredentialMap {
        serde_json::from_value(json!({
            "env": {"API_KEY": "k-123456789"},
            "gmail": {"client_id": "", "client_secret": "x", "refresh_token": "y"}
        }))
        .unwrap()
    }

    fn call(server: &mut McpServer<'_>, request: Value) -> Value {
        let response = server.handle_message(&request.to_string()).unwrap();
        serde_json::to_value(response).unwrap()
    }

    #[test]
    fn test_initialize_and_list_tools() {
        let registry = PluginRegistry::builtin();
        let credentials = credentials();
        let mut server = McpServer::new(registry.bind(&credentials));

        let init = call(&mut server, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}));
        assert_eq!(init["result"]["serverInfo"]["name"], "nakimi");
        assert_eq!(init["result"]["protocolVersion"], PROTOCOL_VERSION);

        assert!(server
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .is_none());
        assert!(server.is_initialized());

        let list = call(&mut server, json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}));
        let names: Vec<&str> = list["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        // gmail is missing its client_id
        assert_eq!(names, vec!["env_list", "env_get", "env_export"]);

        let get = &list["result"]["tools"][1];
        assert_eq!(get["inputSchema"]["required"], json!(["key"]));
    }

    #[test]
    fn test_call_tool() {
        let registry = PluginRegistry::builtin();
        let credentials = credentials();
        let mut server = McpServer::new(registry.bind(&credentials));

        let ok = call(
            &mut server,
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "env_get", "arguments": {"key": "API_KEY"}}
            }),
        );
        assert_eq!(ok["result"]["content"][0]["text"], "k-123456789");
        assert!(ok["result"].get("isError").is_none());

        let unavailable = call(
            &mut server,
            json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": {"name": "gmail_health"}
            }),
        );
        assert_eq!(unavailable["result"]["isError"], true);

        let missing_arg = call(
            &mut server,
            json!({
                "jsonrpc": "2.0", "id": 5, "method": "tools/call",
                "params": {"name": "env_get", "arguments": {}}
            }),
        );
        assert_eq!(missing_arg["result"]["isError"], true);
    }

    #[test]
    fn test_protocol_errors() {
        let registry = PluginRegistry::builtin();
        let credentials = credentials();
        let mut server = McpServer::new(registry.bind(&credentials));

        let parse = serde_json::to_value(server.handle_message("{not json").unwrap()).unwrap();
        assert_eq!(parse["error"]["code"], PARSE_ERROR);

        let unknown = call(&mut server, json!({"jsonrpc": "2.0", "id": 6, "method": "resources/list"}));
        assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);

        let no_params = call(&mut server, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call"}));
        assert_eq!(no_params["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_serve_over_streams() {
        let registry = PluginRegistry::builtin();
        let credentials = credentials();
        let mut server = McpServer::new(registry.bind(&credentials));

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"env_list"}}"#,
            "\n",
        );
        let mut output = Vec::new();
        server
            .serve(BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[1]["result"]["content"][0]["text"], "API_KEY");
    }
}
