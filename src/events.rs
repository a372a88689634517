//! The client-facing event protocol and the engine-message translator.
//!
//! The wire protocol is a small, strictly ordered union: at most one
//! `session_init` and always first if present; exactly one of `done` /
//! `error`, always last, never both. [`EventTranslator`] enforces those
//! invariants while projecting the engine's message stream, one message at
//! a time, into events the caller forwards immediately.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{ContentBlock, EngineMessage};

/// Tool name whose successful completion means a memory write landed.
const MEMORY_SAVE_TOOL: &str = "mcp__memory__memory_save";

/// One event on the client wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
    #[serde(rename_all = "camelCase")]
    SessionInit { session_id: String, model: String },
    Text { text: String },
    ToolStart {
        id: String,
        name: String,
        /// Serialized invocation input, as the engine enumerated it.
        input: String,
    },
    ToolDone { id: String, name: String },
    ToolError { id: String, name: String, message: String },
    MemorySaved { id: String },
    #[serde(rename_all = "camelCase")]
    Done { text: String, session_id: String },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TranslatorState {
    AwaitingInit,
    Streaming,
    Terminated,
}

/// Translates the engine stream into the wire protocol.
///
/// `AwaitingInit -> Streaming -> Terminated`. Streaming text accumulates;
/// a successful result-class message overwrites the accumulator rather
/// than appending. Exactly one of [`EventTranslator::finish`] /
/// [`EventTranslator::fail`] terminates the turn.
pub struct EventTranslator {
    state: TranslatorState,
    session_id: String,
    streamed: String,
    authoritative: Option<String>,
    /// Invocation id -> tool name, for resolving tool results.
    pending_tools: HashMap<String, String>,
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTranslator {
    pub fn new() -> Self {
        Self {
            state: TranslatorState::AwaitingInit,
            session_id: String::new(),
            streamed: String::new(),
            authoritative: None,
            pending_tools: HashMap::new(),
        }
    }

    /// Session id captured from the engine; empty until an init-class
    /// message arrives.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The authoritative final text: the result-class overwrite when one
    /// occurred, else the streamed concatenation.
    pub fn final_text(&self) -> String {
        self.authoritative
            .clone()
            .unwrap_or_else(|| self.streamed.clone())
    }

    /// Project one engine message into zero or more events, in order.
    pub fn on_message(&mut self, message: &EngineMessage) -> Vec<SseEvent> {
        if self.state == TranslatorState::Terminated {
            return Vec::new();
        }

        let first = self.state == TranslatorState::AwaitingInit;
        self.state = TranslatorState::Streaming;

        let mut events = Vec::new();
        match message {
            EngineMessage::System {
                subtype,
                session_id,
                model,
            } if subtype == "init" => {
                if let Some(id) = session_id {
                    if self.session_id.is_empty() {
                        self.session_id = id.clone();
                    }
                }
                // Only the opening init-class message reaches the wire;
                // anything later would break the init-first invariant.
                if first {
                    events.push(SseEvent::SessionInit {
                        session_id: self.session_id.clone(),
                        model: model.clone().unwrap_or_default(),
                    });
                }
            }
            EngineMessage::System { .. } => {}
            EngineMessage::Assistant { message } => {
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.streamed.push_str(text);
                            events.push(SseEvent::Text { text: text.clone() });
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            self.pending_tools.insert(id.clone(), name.clone());
                            events.push(SseEvent::ToolStart {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.to_string(),
                            });
                        }
                        _ => {}
                    }
                }
            }
            EngineMessage::User { message } => {
                for block in &message.content {
                    let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    else {
                        continue;
                    };
                    let Some(name) = self.pending_tools.remove(tool_use_id) else {
                        continue;
                    };
                    if *is_error {
                        events.push(SseEvent::ToolError {
                            id: tool_use_id.clone(),
                            name,
                            message: result_text(content),
                        });
                    } else {
                        let saved_memory = name == MEMORY_SAVE_TOOL;
                        events.push(SseEvent::ToolDone {
                            id: tool_use_id.clone(),
                            name,
                        });
                        if saved_memory {
                            events.push(SseEvent::MemorySaved {
                                id: tool_use_id.clone(),
                            });
                        }
                    }
                }
            }
            EngineMessage::Result {
                subtype,
                result,
                is_error,
                session_id,
            } => {
                if let Some(id) = session_id {
                    if self.session_id.is_empty() {
                        self.session_id = id.clone();
                    }
                }
                if !*is_error && subtype == "success" {
                    if let Some(text) = result {
                        self.authoritative = Some(text.clone());
                    }
                }
            }
            EngineMessage::Other => {}
        }
        events
    }

    /// Terminate normally: the single `done` event.
    pub fn finish(&mut self) -> SseEvent {
        self.state = TranslatorState::Terminated;
        SseEvent::Done {
            text: self.final_text(),
            session_id: self.session_id.clone(),
        }
    }

    /// Terminate on failure: the single `error` event; `done` is skipped
    /// entirely on this path.
    pub fn fail(&mut self, message: impl Into<String>) -> SseEvent {
        self.state = TranslatorState::Terminated;
        SseEvent::Error {
            message: message.into(),
        }
    }
}

/// Best-effort text of a tool-result payload: a bare string, the joined
/// text blocks of an array, or the raw JSON.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if texts.is_empty() {
                content.to_string()
            } else {
                texts.join("\n")
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
