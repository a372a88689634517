//! Engine implementation backed by the headless CLI.
//!
//! Spawns one CLI process per turn in stream-json mode, hands it the
//! tool-server topology as an inline MCP config, and feeds decoded stdout
//! lines into the turn's [`EngineStream`]. The child is spawned
//! kill-on-drop: when the stream's consumer goes away the engine dies, and
//! the tool servers it launched die with it.

use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{Engine, EngineError, EngineMessage, EngineRequest, EngineStream};

pub struct CliEngine {
    command: String,
}

impl CliEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn mcp_config(request: &EngineRequest) -> String {
        let servers: serde_json::Map<String, Value> = request
            .tool_servers
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    json!({
                        "command": spec.command,
                        "args": spec.args,
                        "env": spec.env,
                    }),
                )
            })
            .collect();
        json!({ "mcpServers": servers }).to_string()
    }
}

#[async_trait::async_trait]
impl Engine for CliEngine {
    async fn start(&self, request: EngineRequest) -> Result<EngineStream, EngineError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--print")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(request.max_steps.to_string())
            .arg("--system-prompt")
            .arg(&request.system_prompt)
            .arg("--allowed-tools")
            .arg(request.allowed_tools.join(","))
            .arg("--mcp-config")
            .arg(Self::mcp_config(&request));

        if let Some(resume) = &request.resume {
            cmd.arg("--resume").arg(resume);
        }
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }

        // Credentials are scoped to this child; the server's own
        // environment stays untouched.
        cmd.envs(&request.env)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(EngineError::Spawn)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Stream("engine stdout unavailable".to_string())
        })?;

        let (tx, stream) = EngineStream::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let next = tokio::select! {
                    next = lines.next_line() => next,
                    // Consumer is gone; dropping the child tears the engine
                    // down promptly even if it never writes again.
                    _ = tx.closed() => return,
                };
                match next {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<EngineMessage>(line) {
                            Ok(message) => {
                                if tx.send(Ok(message)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "skipping undecodable engine line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(EngineError::Stream(e.to_string()))).await;
                        return;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if !status.success() => {
                    let _ = tx
                        .send(Err(EngineError::Exited(status.code().unwrap_or(-1))))
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(Err(EngineError::Stream(e.to_string()))).await;
                }
                _ => {}
            }
        });

        Ok(stream)
    }
}
