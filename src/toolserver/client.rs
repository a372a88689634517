//! Client side of the tool-server protocol.
//!
//! A request/response correlator keyed by request id: writes go out under a
//! lock, a background reader task routes each response line to the oneshot
//! waiting on its id. [`ToolServerClient::spawn`] runs a server subprocess
//! from its launch spec; [`ToolServerClient::attach`] binds to any byte
//! transport, which is how the tests drive a server over an in-process
//! duplex pipe.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::connectors::ToolServerSpec;

use super::{JsonRpcResponse, ToolContent, ToolDefinition, ToolResult, PROTOCOL_VERSION};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to launch tool server: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("tool server transport failed: {0}")]
    Transport(#[source] std::io::Error),
    #[error("tool server closed the connection")]
    Closed,
    #[error("tool server error {code}: {message}")]
    Rpc { code: i32, message: String },
    #[error("tool call failed: {0}")]
    ToolCall(String),
    #[error("undecodable tool server reply: {0}")]
    Decode(#[from] serde_json::Error),
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct ToolServerClient {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    next_id: AtomicI64,
    reader_task: JoinHandle<()>,
    // Held so the subprocess dies with the client (kill-on-drop).
    _child: Option<Child>,
}

impl ToolServerClient {
    /// Launch the subprocess described by `spec` and bind to its stdio.
    /// The child is owned by this client: dropping the client kills it.
    pub fn spawn(spec: &ToolServerSpec) -> Result<Self, ClientError> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ClientError::Spawn)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ClientError::Transport(std::io::Error::other("tool server stdout unavailable"))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            ClientError::Transport(std::io::Error::other("tool server stdin unavailable"))
        })?;

        tracing::debug!(server = %spec.name, command = %spec.command.display(), "spawned tool server");
        Ok(Self::attach_parts(stdout, stdin, Some(child)))
    }

    /// Bind to an arbitrary reader/writer pair (socket, in-process duplex).
    pub fn attach<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::attach_parts(reader, writer, None)
    }

    fn attach_parts<R, W>(reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);

        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response: JsonRpcResponse = match serde_json::from_str(line) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring undecodable line from tool server");
                        continue;
                    }
                };
                let Some(id) = response.id.as_i64() else {
                    continue;
                };
                if let Some(tx) = reader_pending.lock().await.remove(&id) {
                    let _ = tx.send(response);
                }
            }
            // EOF: wake every in-flight request with a closed channel.
            reader_pending.lock().await.clear();
        });

        Self {
            writer: Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicI64::new(1),
            reader_task,
            _child: child,
        }
    }

    /// `initialize` handshake plus the `initialized` notification.
    pub async fn initialize(&self) -> Result<Value, ClientError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": {
                        "name": "attache",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {}
                }),
            )
            .await?;
        self.notify("notifications/initialized").await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ClientError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or(json!([]));
        Ok(serde_json::from_value(tools)?)
    }

    /// Invoke one tool and return its text content.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, ClientError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        let result: ToolResult = serde_json::from_value(result)?;
        let text = result
            .content
            .iter()
            .map(|ToolContent::Text { text }| text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if result.is_error {
            return Err(ClientError::ToolCall(text));
        }
        Ok(text)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Transport(e));
        }

        let response = rx.await.map_err(|_| ClientError::Closed)?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str) -> Result<(), ClientError> {
        let line = json!({ "jsonrpc": "2.0", "method": method, "params": {} }).to_string();
        self.write_line(&line).await.map_err(ClientError::Transport)
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

impl Drop for ToolServerClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolserver::{ToolHandler, ToolServer, INVALID_PARAMS};
    use async_trait::async_trait;

    struct Upper;

    #[async_trait]
    impl ToolHandler for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "Uppercase the input"
        }
        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn call(&self, args: Value) -> anyhow::Result<Value> {
            let text = args
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("missing 'text' argument"))?;
            Ok(Value::String(text.to_uppercase()))
        }
    }

    /// Pair a client with a real server over an in-process duplex pipe,
    /// proving the correlator is transport-independent.
    fn connected_client() -> ToolServerClient {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);

        tokio::spawn(async move {
            let mut server = ToolServer::new("duplex-mcp", "0.0.0");
            server.register(Arc::new(Upper));
            let _ = server.serve(BufReader::new(server_read), server_write).await;
        });

        let (client_read, client_write) = tokio::io::split(client_end);
        ToolServerClient::attach(client_read, client_write)
    }

    #[tokio::test]
    async fn handshake_and_catalog_roundtrip() {
        let client = connected_client();
        let init = client.initialize().await.unwrap();
        assert_eq!(init["serverInfo"]["name"], "duplex-mcp");

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "upper");
    }

    #[tokio::test]
    async fn tool_call_roundtrip() {
        let client = connected_client();
        client.initialize().await.unwrap();
        let out = client
            .call_tool("upper", json!({ "text": "quiet" }))
            .await
            .unwrap();
        assert_eq!(out, "QUIET");
    }

    #[tokio::test]
    async fn unknown_tool_surfaces_rpc_error() {
        let client = connected_client();
        client.initialize().await.unwrap();
        let err = client.call_tool("absent", json!({})).await.unwrap_err();
        match err {
            ClientError::Rpc { code, .. } => assert_eq!(code, INVALID_PARAMS),
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_correlate_by_id() {
        let client = Arc::new(connected_client());
        client.initialize().await.unwrap();

        let mut handles = Vec::new();
        for word in ["alpha", "beta", "gamma", "delta"] {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                (word, client.call_tool("upper", json!({ "text": word })).await.unwrap())
            }));
        }
        for handle in handles {
            let (word, out) = handle.await.unwrap();
            assert_eq!(out, word.to_uppercase());
        }
    }
}
