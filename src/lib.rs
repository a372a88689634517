//! # Attache
//!
//! A self-hosted orchestration server for a personal AI assistant.
//!
//! One turn flows through the server like this:
//!
//! ```text
//!   HTTP request
//!        │
//!        ▼
//!   AuthResolver ──► AuthConfig (mode, model, keys)
//!        │
//!        ▼
//!   Orchestrator ──► per-turn tool-server map (connectors)
//!        │                    │
//!        ▼                    ▼
//!   reasoning engine ◄── spawns tool-server subprocesses
//!        │                (JSON-RPC 2.0 over stdio)
//!        ▼
//!   EventTranslator ──► ordered SSE event stream to the client
//! ```
//!
//! ## Modules
//! - `auth`: credential/model resolution across subscription, API key, and
//!   Gemini fallback sources
//! - `connectors`: per-turn tool-server launch specs from connected
//!   integrations
//! - `toolserver`: the JSON-RPC line protocol every tool server speaks,
//!   server and client side
//! - `engine`: the opaque reasoning-engine boundary and its CLI
//!   implementation
//! - `events`: the client event protocol and the stream translator
//! - `orchestrator`: one turn, composed end to end
//! - `api`: the HTTP surface (status, streaming chat, tasks)

pub mod api;
pub mod auth;
pub mod config;
pub mod connectors;
pub mod engine;
pub mod events;
pub mod memory;
pub mod orchestrator;
pub mod storage;
pub mod toolserver;

pub use config::Config;
