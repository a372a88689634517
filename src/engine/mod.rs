//! The reasoning-engine boundary.
//!
//! The engine is opaque: it consumes a prompt plus a tool topology and
//! produces a stream of messages. Everything it emits is decoded exactly
//! once, here, into [`EngineMessage`]; downstream code matches the union
//! exhaustively and never touches raw JSON.

mod cli;

pub use cli::CliEngine;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::connectors::ToolServerSpec;

/// One decoded message from the engine stream, tagged by class.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    /// Init-class bookkeeping; `subtype == "init"` establishes the session.
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    /// Assistant output: text fragments and embedded tool invocations.
    Assistant { message: MessagePayload },
    /// Tool results echoed back into the conversation.
    User { message: MessagePayload },
    /// Result-class: the engine's authoritative final answer.
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Message classes this server has no use for.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Everything one engine invocation needs, made explicit.
///
/// `env` carries the resolved credentials for this call only; the engine
/// subprocess sees them, the server process never exports them. That keeps
/// concurrent turns with different credentials from racing on ambient
/// state.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub prompt: String,
    pub system_prompt: String,
    /// Prior session id; `None` on a first turn, never an empty marker.
    pub resume: Option<String>,
    /// Selected model; `None` when the active mode forces its own.
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub tool_servers: BTreeMap<String, ToolServerSpec>,
    pub max_steps: u32,
    pub workdir: PathBuf,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch engine: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine stream failed: {0}")]
    Stream(String),
    #[error("engine exited with status {0}")]
    Exited(i32),
}

/// The message stream of one engine invocation. Dropping it tears down
/// whatever is producing it (for [`CliEngine`], the engine subprocess and
/// transitively its tool-server children).
pub struct EngineStream {
    rx: mpsc::Receiver<Result<EngineMessage, EngineError>>,
}

impl EngineStream {
    /// A channel-backed stream; the producer holds the sender.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<EngineMessage, EngineError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    /// A stream over a fixed message script. Lets tests and diagnostics
    /// drive the orchestrator without a real engine.
    pub fn scripted(items: Vec<Result<EngineMessage, EngineError>>) -> Self {
        let (tx, stream) = Self::channel(items.len().max(1));
        for item in items {
            // Capacity covers the whole script.
            let _ = tx.try_send(item);
        }
        stream
    }

    pub async fn next(&mut self) -> Option<Result<EngineMessage, EngineError>> {
        self.rx.recv().await
    }
}

/// An opaque reasoning capability. [`CliEngine`] is the real one; tests
/// substitute scripted implementations.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn start(&self, request: EngineRequest) -> Result<EngineStream, EngineError>;
}
