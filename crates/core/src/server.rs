//! MCP server glue. Exposes exactly four meta-tools (`list_servers`,
//! `get_function`, `execute_code`, `get_cached_code`) over JSON-RPC 2.0,
//! with stdio line framing or an HTTP POST endpoint. None of the four ever
//! raises: everything that escapes a handler is converted into an
//! `{ error, error_type: "internal" }` payload.

use crate::runtime::{CacheStore, CodeExecutor, Registry};
use axum::extract::State;
use axum::routing::post;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ============================================================
// JSON-RPC 2.0 types
// ============================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<Value>, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
            }),
        }
    }
}

// ============================================================
// Server
// ============================================================

pub struct McpServer {
    registry: Arc<Registry>,
    cache: Arc<CacheStore>,
    executor: Arc<CodeExecutor>,
}

impl McpServer {
    #[must_use]
    pub fn new(registry: Arc<Registry>, cache: Arc<CacheStore>, executor: Arc<CodeExecutor>) -> Self {
        Self {
            registry,
            cache,
            executor,
        }
    }

    /// Handle one JSON-RPC message. Notifications produce no response.
    pub async fn handle_message(&self, raw: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable JSON-RPC message");
                return Some(JsonRpcResponse::failure(None, -32700, "Parse error"));
            }
        };

        let is_notification = request.id.is_none();
        let response = self.dispatch(request).await;
        if is_notification {
            None
        } else {
            Some(response)
        }
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "mfp",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "instructions":
                        "MFP exposes compiled API servers through 4 meta-tools. Workflow: \
                         1) list_servers to see what is available, \
                         2) get_function for signatures and examples, \
                         3) execute_code to run Python that calls those functions, \
                         4) get_cached_code to find and reuse previously successful code.",
                }),
            ),
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            "notifications/initialized" => JsonRpcResponse::success(request.id, json!({})),
            "tools/list" => JsonRpcResponse::success(request.id, json!({ "tools": tool_schemas() })),
            "tools/call" => {
                let params = request.params.unwrap_or(Value::Null);
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                let payload = self.call_tool(name, &arguments).await;
                let is_error = payload.get("error").is_some()
                    || payload.get("success").and_then(Value::as_bool) == Some(false);
                JsonRpcResponse::success(
                    request.id,
                    json!({
                        "content": [{ "type": "text", "text": payload.to_string() }],
                        "isError": is_error,
                    }),
                )
            }
            other => {
                tracing::debug!(method = %other, "unknown JSON-RPC method");
                JsonRpcResponse::failure(request.id, -32601, "Method not found")
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> Value {
        match name {
            "list_servers" => self.tool_list_servers(),
            "get_function" => self.tool_get_function(arguments),
            "execute_code" => self.tool_execute_code(arguments).await,
            "get_cached_code" => self.tool_get_cached_code(arguments).await,
            other => json!({
                "error": format!("Unknown tool '{other}'"),
                "error_type": "internal",
            }),
        }
    }

    fn tool_list_servers(&self) -> Value {
        let servers: Vec<Value> = self
            .registry
            .list_servers()
            .into_iter()
            .map(|info| {
                json!({
                    "name": info.name,
                    "summary": info.description,
                    "function_count": info.functions.len(),
                    "functions": info.functions,
                })
            })
            .collect();
        tracing::info!(server_count = servers.len(), "tool list_servers called");
        json!({ "servers": servers })
    }

    fn tool_get_function(&self, arguments: &Value) -> Value {
        let server = arguments.get("server").and_then(Value::as_str).unwrap_or("");
        let function = arguments.get("name").and_then(Value::as_str).unwrap_or("");

        match self.registry.get_function(server, function) {
            Ok(info) => {
                tracing::info!(server = %server, function = %function, "tool get_function called");
                let import_statement =
                    format!("from {server}.functions import {}", info.function_name);
                let usage_example = format!(
                    "{import_statement}\n\ndef main():\n    return {}",
                    info.signature
                );
                json!({
                    "server": info.server_name,
                    "function": info.function_name,
                    "summary": info.summary,
                    "method": info.method,
                    "path": info.path,
                    "parameters": info.parameters,
                    "returns": info.returns,
                    "usage_example": usage_example,
                    "import_statement": import_statement,
                    "source_excerpt": info.source_excerpt,
                })
            }
            Err(e) => json!({ "error": e.to_string(), "error_type": e.error_type() }),
        }
    }

    async fn tool_execute_code(&self, arguments: &Value) -> Value {
        let code = arguments.get("code").and_then(Value::as_str).unwrap_or("");
        let description = arguments
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");

        if code.trim().is_empty() {
            return json!({
                "success": false,
                "error": "No code provided",
                "error_type": "internal",
            });
        }

        let result = self.executor.execute(code, description).await;
        serde_json::to_value(&result).unwrap_or_else(|e| {
            tracing::error!(error = %e, "execution result serialization failed");
            json!({
                "success": false,
                "error": "Internal error",
                "error_type": "internal",
            })
        })
    }

    async fn tool_get_cached_code(&self, arguments: &Value) -> Value {
        let search = arguments.get("search").and_then(Value::as_str);
        let limit = arguments
            .get("limit")
            .and_then(Value::as_i64)
            .unwrap_or(50)
            .clamp(1, 200);

        match self.cache.search(search, limit).await {
            Ok(entries) => {
                tracing::info!(results = entries.len(), "tool get_cached_code called");
                json!({ "entries": entries })
            }
            Err(e) => {
                tracing::error!(error = %e, "cache search failed");
                json!({ "error": "Cache unavailable", "error_type": "internal" })
            }
        }
    }

    /// Serve MCP over stdio: one JSON-RPC message per line.
    pub async fn run_stdio(self: Arc<Self>) -> anyhow::Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(stdin).lines();

        tracing::info!("MCP server listening on stdio");
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_message(&line).await {
                let encoded = serde_json::to_string(&response)?;
                stdout.write_all(encoded.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }

        tracing::info!("stdin closed, MCP server shutting down");
        Ok(())
    }

    /// Serve MCP over HTTP: JSON-RPC POST to `/mcp`.
    pub async fn run_http(self: Arc<Self>, host: &str, port: u16) -> anyhow::Result<()> {
        let app = axum::Router::new()
            .route("/mcp", post(http_rpc_handler))
            .with_state(self);

        let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
        tracing::info!("MCP server listening on http://{host}:{port}/mcp");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn http_rpc_handler(
    State(server): State<Arc<McpServer>>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
    let id = request.id.clone();
    match serde_json::to_string(&request) {
        Ok(raw) => match server.handle_message(&raw).await {
            Some(response) => Json(response),
            None => Json(JsonRpcResponse::success(id, Value::Null)),
        },
        Err(_) => Json(JsonRpcResponse::failure(id, -32700, "Parse error")),
    }
}

fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "name": "list_servers",
            "description": "List all available API servers and their functions. \
                Use this first to discover what APIs exist.",
            "inputSchema": {
                "type": "object",
                "properties": {},
            },
        }),
        json!({
            "name": "get_function",
            "description": "Get a function's signature, parameters, return fields, \
                and a usage example so you can call it correctly from execute_code.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "server": { "type": "string", "description": "Server name from list_servers" },
                    "name": { "type": "string", "description": "Function name to inspect" },
                },
                "required": ["server", "name"],
            },
        }),
        json!({
            "name": "execute_code",
            "description": "Execute Python code in an isolated sandbox with access to the \
                compiled server functions. The code must define a main() function returning \
                the result, or a `result` variable. Import servers with \
                `from {server}.functions import {function}`.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Self-contained Python code" },
                    "description": { "type": "string", "description": "What the code does (used for caching)" },
                },
                "required": ["code", "description"],
            },
        }),
        json!({
            "name": "get_cached_code",
            "description": "Search previously successful code snippets by description \
                and reuse them instead of rewriting from scratch.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "search": { "type": "string", "description": "Substring to match against descriptions" },
                    "limit": { "type": "integer", "description": "Maximum entries to return (default 50)" },
                },
            },
        }),
    ]
}
