//! One conversational turn, end to end.
//!
//! The orchestrator composes the leaves: it materializes the resolved
//! credentials into the engine request, assembles system instructions,
//! computes the allowed-tool surface from the per-turn tool-server map,
//! drives the translator over the engine stream, and guarantees exactly
//! one terminal event on every path.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{self, AuthConfig, AuthMode};
use crate::config::Config;
use crate::connectors::{Registry, ToolServerSpec};
use crate::engine::{Engine, EngineRequest};
use crate::events::{EventTranslator, SseEvent};
use crate::storage::StorageClient;

/// Tools every turn may use regardless of connectors.
const CORE_TOOLS: &[&str] = &["WebSearch", "WebFetch"];

const PERSONA: &str = "\
You are Attache, a personal assistant with access to the user's connected \
services. Be direct and concise. Use the available tools to answer from \
real data instead of guessing; say so when a needed service is not \
connected. Save durable facts about the user with the memory tools when \
they come up.";

/// One incoming user message.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    pub message: String,
    /// Resume token from a prior turn; empty and missing mean the same.
    pub session_id: Option<String>,
}

/// What a finished turn reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub session_id: String,
    pub response: String,
}

#[derive(Debug, Error)]
pub enum TurnError {
    /// The engine failed; the matching `error` event was already emitted.
    #[error("{0}")]
    Engine(String),
    /// The event sink closed mid-turn (client went away).
    #[error("event sink closed")]
    SinkClosed,
}

pub struct Orchestrator {
    engine: Arc<dyn Engine>,
    registry: Registry,
    storage: Option<StorageClient>,
    config: Config,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn Engine>,
        registry: Registry,
        storage: Option<StorageClient>,
        config: Config,
    ) -> Self {
        Self {
            engine,
            registry,
            storage,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one turn, forwarding each produced event immediately and in
    /// order. Exactly one terminal event reaches the sink: `done` on
    /// success, `error` otherwise.
    pub async fn run_turn(
        &self,
        request: &TurnRequest,
        auth: &AuthConfig,
        connectors: &[String],
        events: &mpsc::Sender<SseEvent>,
    ) -> Result<TurnOutcome, TurnError> {
        let turn_id = Uuid::new_v4();
        tracing::info!(
            %turn_id,
            user_id = %request.user_id,
            mode = ?auth.mode,
            resumed = request.session_id.is_some(),
            "starting turn"
        );

        let servers = self.registry.build(connectors, &request.user_id);
        let system_prompt = self.system_prompt(&request.user_id).await;

        let engine_request = EngineRequest {
            prompt: request.message.clone(),
            system_prompt,
            resume: request.session_id.clone().filter(|s| !s.is_empty()),
            // Gemini mode forces its own fixed model downstream; passing one
            // here would fight it.
            model: match auth.mode {
                AuthMode::Gemini => None,
                _ => Some(auth.model.clone()),
            },
            allowed_tools: allowed_tools(&servers),
            tool_servers: servers,
            max_steps: self.config.max_steps,
            workdir: self.config.workspace_dir.clone(),
            env: auth::agent_env(auth),
        };

        let mut translator = EventTranslator::new();
        let mut stream = match self.engine.start(engine_request).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(%turn_id, error = %e, "engine failed to start");
                let event = translator.fail(e.to_string());
                let _ = events.send(event).await;
                return Err(TurnError::Engine(e.to_string()));
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(message) => {
                    for event in translator.on_message(&message) {
                        if events.send(event).await.is_err() {
                            // Sink closed: drop the stream, which tears down
                            // the engine and its tool servers.
                            tracing::info!(%turn_id, "event sink closed; aborting turn");
                            return Err(TurnError::SinkClosed);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(%turn_id, error = %e, "engine stream failed");
                    let event = translator.fail(e.to_string());
                    let _ = events.send(event).await;
                    return Err(TurnError::Engine(e.to_string()));
                }
            }
        }

        let done = translator.finish();
        if events.send(done).await.is_err() {
            return Err(TurnError::SinkClosed);
        }

        let outcome = TurnOutcome {
            session_id: translator.session_id().to_string(),
            response: translator.final_text(),
        };
        tracing::info!(%turn_id, session_id = %outcome.session_id, "turn complete");
        Ok(outcome)
    }

    /// Persona, then the user profile when non-empty, then the persistent
    /// memory block when non-empty. Omitted sections contribute nothing.
    async fn system_prompt(&self, user_id: &str) -> String {
        let mut sections = vec![PERSONA.to_string()];

        let Some(storage) = &self.storage else {
            return sections.join("\n\n");
        };

        match storage.fetch_profile(user_id).await {
            Ok(Some(profile)) if !profile.trim().is_empty() => {
                sections.push(format!("## About the user\n{}", profile.trim()));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(user_id, error = %e, "profile fetch failed; continuing without"),
        }

        match storage.list_persistent_memories(user_id).await {
            Ok(mut entries) if !entries.is_empty() => {
                // Stable sort: ties keep their insertion order.
                entries.sort_by(|a, b| b.importance.cmp(&a.importance));
                let lines: Vec<String> = entries
                    .iter()
                    .map(|e| format!("- {}", e.content))
                    .collect();
                sections.push(format!(
                    "## Remembered facts and preferences\n{}",
                    lines.join("\n")
                ));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(user_id, error = %e, "memory fetch failed; continuing without"),
        }

        sections.join("\n\n")
    }
}

/// The fixed core set plus one server-level wildcard per tool server.
/// Individual tool names are never enumerated here.
fn allowed_tools(servers: &BTreeMap<String, ToolServerSpec>) -> Vec<String> {
    let mut tools: Vec<String> = CORE_TOOLS.iter().map(|t| t.to_string()).collect();
    tools.extend(servers.keys().map(|name| format!("mcp__{name}")));
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DEFAULT_ANTHROPIC_MODEL;
    use crate::engine::{
        ContentBlock, EngineError, EngineMessage, EngineStream, MessagePayload,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Engine double: replays a script and records the request it got.
    struct ScriptedEngine {
        script: Mutex<Vec<Result<EngineMessage, EngineError>>>,
        seen: Mutex<Option<EngineRequest>>,
    }

    impl ScriptedEngine {
        fn new(script: Vec<Result<EngineMessage, EngineError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(None),
            })
        }

        fn request(&self) -> EngineRequest {
            self.seen.lock().unwrap().clone().expect("engine was not invoked")
        }
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        async fn start(&self, request: EngineRequest) -> Result<EngineStream, EngineError> {
            *self.seen.lock().unwrap() = Some(request);
            Ok(EngineStream::scripted(std::mem::take(
                &mut *self.script.lock().unwrap(),
            )))
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl Engine for FailingEngine {
        async fn start(&self, _request: EngineRequest) -> Result<EngineStream, EngineError> {
            Err(EngineError::Spawn(std::io::Error::other("no such binary")))
        }
    }

    fn orchestrator(engine: Arc<dyn Engine>) -> Orchestrator {
        let registry = Registry::new(
            PathBuf::from("/opt/attache/bin"),
            BTreeMap::new(),
            BTreeMap::new(),
        );
        Orchestrator::new(engine, registry, None, Config::default())
    }

    fn api_key_auth() -> AuthConfig {
        AuthConfig {
            mode: AuthMode::ApiKey,
            model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            anthropic_api_key: Some("sk-ant-test".to_string()),
            google_api_key: None,
        }
    }

    fn turn_request() -> TurnRequest {
        TurnRequest {
            user_id: "user-1".to_string(),
            message: "anything new?".to_string(),
            session_id: None,
        }
    }

    fn script() -> Vec<Result<EngineMessage, EngineError>> {
        vec![
            Ok(EngineMessage::System {
                subtype: "init".to_string(),
                session_id: Some("s1".to_string()),
                model: Some(DEFAULT_ANTHROPIC_MODEL.to_string()),
            }),
            Ok(EngineMessage::Assistant {
                message: MessagePayload {
                    content: vec![ContentBlock::Text {
                        text: "Hi".to_string(),
                    }],
                },
            }),
            Ok(EngineMessage::Assistant {
                message: MessagePayload {
                    content: vec![ContentBlock::ToolUse {
                        id: "t1".to_string(),
                        name: "gmail_list_recent".to_string(),
                        input: json!({}),
                    }],
                },
            }),
            Ok(EngineMessage::Result {
                subtype: "success".to_string(),
                result: Some("Hi there".to_string()),
                is_error: false,
                session_id: Some("s1".to_string()),
            }),
        ]
    }

    async fn collect(
        orchestrator: &Orchestrator,
        request: &TurnRequest,
        auth: &AuthConfig,
        connectors: &[String],
    ) -> (Vec<SseEvent>, Result<TurnOutcome, TurnError>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = orchestrator.run_turn(request, auth, connectors, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, result)
    }

    #[tokio::test]
    async fn turn_emits_ordered_events_and_returns_outcome() {
        let engine = ScriptedEngine::new(script());
        let orchestrator = orchestrator(engine.clone());
        let (events, result) = collect(
            &orchestrator,
            &turn_request(),
            &api_key_auth(),
            &["gmail".to_string()],
        )
        .await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0],
            SseEvent::SessionInit { session_id, .. } if session_id == "s1"));
        assert!(matches!(&events[1], SseEvent::Text { text } if text == "Hi"));
        assert!(matches!(&events[2],
            SseEvent::ToolStart { name, .. } if name == "gmail_list_recent"));
        assert!(matches!(&events[3],
            SseEvent::Done { text, .. } if text == "Hi there"));

        let outcome = result.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome {
                session_id: "s1".to_string(),
                response: "Hi there".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn engine_request_carries_explicit_credentials_and_surface() {
        let engine = ScriptedEngine::new(script());
        let orchestrator = orchestrator(engine.clone());
        let _ = collect(
            &orchestrator,
            &turn_request(),
            &api_key_auth(),
            &["gmail".to_string(), "bogus".to_string()],
        )
        .await;

        let request = engine.request();
        assert_eq!(
            request.env.get("ANTHROPIC_API_KEY").map(String::as_str),
            Some("sk-ant-test")
        );
        assert_eq!(request.model.as_deref(), Some(DEFAULT_ANTHROPIC_MODEL));
        assert_eq!(request.resume, None);
        assert_eq!(request.max_steps, 25);
        // Core tools plus one server-level wildcard each; nothing per-tool.
        assert_eq!(
            request.allowed_tools,
            vec!["WebSearch", "WebFetch", "mcp__gmail", "mcp__memory"]
        );
        assert!(request.tool_servers.contains_key("memory"));
        assert!(request.tool_servers.contains_key("gmail"));
        assert!(!request.tool_servers.contains_key("bogus"));
        assert!(request.system_prompt.starts_with("You are Attache"));
    }

    #[tokio::test]
    async fn gemini_mode_omits_the_model() {
        let engine = ScriptedEngine::new(script());
        let orchestrator = orchestrator(engine.clone());
        let auth = AuthConfig {
            mode: AuthMode::Gemini,
            model: "gemini-2.5-flash".to_string(),
            anthropic_api_key: None,
            google_api_key: Some("g-key".to_string()),
        };
        let _ = collect(&orchestrator, &turn_request(), &auth, &[]).await;

        let request = engine.request();
        assert_eq!(request.model, None);
        assert_eq!(
            request.env.get("GEMINI_API_KEY").map(String::as_str),
            Some("g-key")
        );
    }

    #[tokio::test]
    async fn resume_token_passes_through_but_empty_is_omitted() {
        let engine = ScriptedEngine::new(script());
        let orch = orchestrator(engine.clone());
        let mut request = turn_request();
        request.session_id = Some(String::new());
        let _ = collect(&orch, &request, &api_key_auth(), &[]).await;
        assert_eq!(engine.request().resume, None);

        let engine = ScriptedEngine::new(script());
        let orch = orchestrator(engine.clone());
        let mut request = turn_request();
        request.session_id = Some("s-prior".to_string());
        let _ = collect(&orch, &request, &api_key_auth(), &[]).await;
        assert_eq!(engine.request().resume.as_deref(), Some("s-prior"));
    }

    #[tokio::test]
    async fn engine_start_failure_yields_single_error_event() {
        let orchestrator = orchestrator(Arc::new(FailingEngine));
        let (events, result) = collect(
            &orchestrator,
            &turn_request(),
            &api_key_auth(),
            &[],
        )
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SseEvent::Error { .. }));
        assert!(matches!(result, Err(TurnError::Engine(_))));
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_error_and_skips_done() {
        let mut script = script();
        script.truncate(2);
        script.push(Err(EngineError::Stream("connection reset".to_string())));
        let engine = ScriptedEngine::new(script);
        let orchestrator = orchestrator(engine);
        let (events, result) = collect(
            &orchestrator,
            &turn_request(),
            &api_key_auth(),
            &[],
        )
        .await;

        let terminal: Vec<&SseEvent> = events
            .iter()
            .filter(|e| matches!(e, SseEvent::Done { .. } | SseEvent::Error { .. }))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], SseEvent::Error { .. }));
        assert!(matches!(events.last(), Some(SseEvent::Error { .. })));
        assert!(matches!(result, Err(TurnError::Engine(_))));
    }

    #[tokio::test]
    async fn concurrent_turns_do_not_share_credentials() {
        // Two turns with different auth configs run at once; each engine
        // invocation must see exactly its own key.
        let engine_a = ScriptedEngine::new(script());
        let engine_b = ScriptedEngine::new(script());
        let orch_a = orchestrator(engine_a.clone());
        let orch_b = orchestrator(engine_b.clone());

        let auth_a = api_key_auth();
        let mut auth_b = api_key_auth();
        auth_b.anthropic_api_key = Some("sk-ant-other".to_string());

        let request = turn_request();
        let ((_, a), (_, b)) = tokio::join!(
            collect(&orch_a, &request, &auth_a, &[]),
            collect(&orch_b, &request, &auth_b, &[]),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(
            engine_a.request().env.get("ANTHROPIC_API_KEY").map(String::as_str),
            Some("sk-ant-test")
        );
        assert_eq!(
            engine_b.request().env.get("ANTHROPIC_API_KEY").map(String::as_str),
            Some("sk-ant-other")
        );
    }
}
