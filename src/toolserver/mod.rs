//! The JSON-RPC 2.0 line protocol every tool server speaks.
//!
//! Transport is one JSON object per line in each direction; no batching,
//! no alternate framing. The server side is a dispatch table of method ->
//! handler; the client side (see [`client`]) is a request/response
//! correlator keyed by request id. Both are written against generic
//! reader/writer pairs, so the same module serves stdio subprocesses, a
//! socket, or an in-process channel.

pub mod client;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Fixed application code for handler failures surfaced over the wire.
pub const APPLICATION_ERROR: i32 = -32000;
pub const INVALID_PARAMS: i32 = -32602;
pub const METHOD_NOT_FOUND: i32 = -32601;

// =============================================================================
// JSON-RPC Types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

// =============================================================================
// Tool surface
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

/// One tool exposed by a server. Handlers own their integration's outbound
/// call logic; the protocol layer only frames and dispatches.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

// =============================================================================
// Server
// =============================================================================

/// A tool server: a static catalog plus a method dispatch loop.
pub struct ToolServer {
    name: String,
    version: String,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// The static tool catalog, identical for every `tools/list` call.
    pub fn catalog(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .handlers
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Handle one input line. Returns the serialized response line, or
    /// `None` when the line produces no output (notifications, unparseable
    /// input).
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                // Malformed lines are dropped, never answered and never fatal.
                tracing::debug!(error = %e, "dropping unparseable protocol line");
                return None;
            }
        };

        let response = self.dispatch(request).await?;
        match serde_json::to_string(&response) {
            Ok(line) => Some(line),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response");
                None
            }
        }
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        match request.method.as_str() {
            "initialize" => Some(JsonRpcResponse::success(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": self.name,
                        "version": self.version,
                    },
                    "capabilities": {
                        "tools": {
                            "listChanged": false
                        }
                    }
                }),
            )),
            method if method.starts_with("notifications/") => None,
            "tools/list" => Some(JsonRpcResponse::success(
                request.id,
                json!({ "tools": self.catalog() }),
            )),
            "tools/call" => Some(self.call_tool(request.id, &request.params).await),
            other => Some(JsonRpcResponse::error(
                request.id,
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    async fn call_tool(&self, id: Value, params: &Value) -> JsonRpcResponse {
        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        let Some(handler) = self.handlers.get(name) else {
            return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Unknown tool: {name}"));
        };

        match handler.call(args).await {
            Ok(value) => {
                let text = match value {
                    Value::String(s) => s,
                    other => serde_json::to_string_pretty(&other)
                        .unwrap_or_else(|_| other.to_string()),
                };
                let result = ToolResult {
                    content: vec![ToolContent::Text { text }],
                    is_error: false,
                };
                match serde_json::to_value(&result) {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::error(id, APPLICATION_ERROR, e.to_string()),
                }
            }
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool handler failed");
                JsonRpcResponse::error(id, APPLICATION_ERROR, format!("{name}: {e:#}"))
            }
        }
    }

    /// Serve the protocol over any line transport until EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(line).await {
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }
        Ok(())
    }

    /// Serve over this process's stdio. Stdout carries protocol lines only;
    /// anything diagnostic must go to stderr.
    pub async fn serve_stdio(&self) -> anyhow::Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }
}
