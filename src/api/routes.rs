//! HTTP route handlers.
//!
//! The streaming chat endpoint and the collecting task endpoint run the
//! same turn pipeline; the only difference is whether events leave as they
//! happen or get folded into one response. A client always receives a
//! well-formed stream: failures surface as one terminal `error` event, not
//! a dropped connection.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthMode, AuthOverrides, AuthResolver, ProviderOverride};
use crate::config::Config;
use crate::connectors::Registry;
use crate::engine::CliEngine;
use crate::events::SseEvent;
use crate::orchestrator::{Orchestrator, TurnRequest};
use crate::storage::StorageClient;
use crate::toolserver::client::ToolServerClient;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub resolver: AuthResolver,
    pub orchestrator: Orchestrator,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    if let Err(e) = std::fs::create_dir_all(&config.workspace_dir) {
        tracing::warn!(
            workspace = %config.workspace_dir.display(),
            error = %e,
            "failed to create workspace dir; engine runs may fail"
        );
    }

    let resolver = AuthResolver::from_env(&config);
    let registry = Registry::from_env(&config);
    let storage = StorageClient::from_config(&config);
    let engine = Arc::new(CliEngine::new(config.engine_command.clone()));
    let orchestrator = Orchestrator::new(engine, registry, storage, config.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        resolver,
        orchestrator,
    });

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/chat", post(chat))
        .route("/api/task", post(task))
        .route("/api/tools", get(list_tools))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Connected integration ids for this user.
    #[serde(default)]
    pub connectors: Vec<String>,
    #[serde(default)]
    pub provider: Option<ProviderOverride>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatRequest {
    fn overrides(&self) -> AuthOverrides {
        AuthOverrides {
            provider: self.provider,
            preferred_model: self.model.clone(),
        }
    }

    fn turn(&self) -> TurnRequest {
        TurnRequest {
            user_id: self.user_id.clone(),
            message: self.message.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<AuthMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    display: String,
    google_fallback_available: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Credential status, resolved fresh on every call. An unconfigured server
/// answers structurally, never with a 500.
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    match state.resolver.resolve(&AuthOverrides::default()) {
        Ok(auth) => {
            let info = state.resolver.status_info(&auth);
            Json(StatusResponse {
                configured: true,
                mode: Some(auth.mode),
                model: Some(auth.model),
                display: info.display,
                google_fallback_available: info.google_fallback_available,
            })
        }
        Err(e) => Json(StatusResponse {
            configured: false,
            mode: None,
            model: None,
            display: e.to_string(),
            google_fallback_available: false,
        }),
    }
}

/// Streaming chat: one turn, events forwarded live as SSE frames.
async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        // Auth failures short-circuit before any subprocess exists.
        let auth = match state.resolver.resolve(&request.overrides()) {
            Ok(auth) => auth,
            Err(e) => {
                yield Ok(event_frame(&SseEvent::Error { message: e.to_string() }));
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<SseEvent>(64);
        let turn = request.turn();
        let connectors = request.connectors.clone();
        let state = Arc::clone(&state);
        let worker = tokio::spawn(async move {
            let _ = state
                .orchestrator
                .run_turn(&turn, &auth, &connectors, &tx)
                .await;
        });

        while let Some(event) = rx.recv().await {
            yield Ok(event_frame(&event));
        }
        let _ = worker.await;
    };

    Sse::new(stream)
}

/// Non-streaming turn: collects the identical event sequence and folds the
/// terminal event into one response.
async fn task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Json<TaskResponse> {
    let auth = match state.resolver.resolve(&request.overrides()) {
        Ok(auth) => auth,
        Err(e) => {
            return Json(TaskResponse {
                success: false,
                response: None,
                session_id: None,
                error: Some(e.to_string()),
            })
        }
    };

    let (tx, mut rx) = mpsc::channel::<SseEvent>(64);
    let turn = request.turn();
    let connectors = request.connectors.clone();
    let worker_state = Arc::clone(&state);
    let worker = tokio::spawn(async move {
        let _ = worker_state
            .orchestrator
            .run_turn(&turn, &auth, &connectors, &tx)
            .await;
    });

    let mut terminal = None;
    while let Some(event) = rx.recv().await {
        if matches!(event, SseEvent::Done { .. } | SseEvent::Error { .. }) {
            terminal = Some(event);
        }
    }
    let _ = worker.await;

    Json(match terminal {
        Some(SseEvent::Done { text, session_id }) => TaskResponse {
            success: true,
            response: Some(text),
            session_id: Some(session_id),
            error: None,
        },
        Some(SseEvent::Error { message }) => TaskResponse {
            success: false,
            response: None,
            session_id: None,
            error: Some(message),
        },
        _ => TaskResponse {
            success: false,
            response: None,
            session_id: None,
            error: Some("turn ended without a terminal event".to_string()),
        },
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsQuery {
    #[serde(default)]
    connectors: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// Diagnostic: spawn the tool servers a connector set would get and report
/// each server's catalog. Failures are isolated per server.
async fn list_tools(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ToolsQuery>,
) -> Json<Value> {
    let connectors: Vec<String> = query
        .connectors
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let user_id = query.user_id.as_deref().unwrap_or("diagnostic");

    let specs = state.orchestrator.registry().build(&connectors, user_id);
    let mut servers = serde_json::Map::new();
    for (name, spec) in specs {
        servers.insert(name.clone(), probe_server(&spec).await);
    }
    Json(json!({ "servers": servers }))
}

async fn probe_server(spec: &crate::connectors::ToolServerSpec) -> Value {
    const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

    let client = match ToolServerClient::spawn(spec) {
        Ok(client) => client,
        Err(e) => return json!({ "error": e.to_string() }),
    };
    let catalog = tokio::time::timeout(PROBE_TIMEOUT, async {
        client.initialize().await?;
        client.list_tools().await
    })
    .await;
    match catalog {
        Ok(Ok(tools)) => json!({ "tools": tools }),
        Ok(Err(e)) => json!({ "error": e.to_string() }),
        Err(_) => json!({ "error": "tool server did not answer in time" }),
    }
}

fn event_frame(event: &SseEvent) -> Event {
    // SseEvent serialization cannot fail; fall back to a bare error frame
    // if it somehow does.
    Event::default().json_data(event).unwrap_or_else(|_| {
        Event::default().data(r#"{"type":"error","message":"serialization failed"}"#)
    })
}
