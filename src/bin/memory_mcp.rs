//! Tool server for the user's memory store.
//!
//! Spawned once per turn by the reasoning engine from the registry's
//! launch spec. Speaks JSON-RPC 2.0 over stdio; stdout carries protocol
//! lines only, diagnostics go to stderr.

use std::sync::Arc;

use attache::connectors::{STORAGE_KEY_VAR, STORAGE_URL_VAR, USER_ID_VAR};
use attache::memory::register_memory_tools;
use attache::storage::StorageClient;
use attache::toolserver::ToolServer;

fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("{name} must be set"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eprintln!("[memory-mcp] starting");

    let user_id = required_env(USER_ID_VAR)?;
    let storage_url = required_env(STORAGE_URL_VAR)?;
    let storage_key = required_env(STORAGE_KEY_VAR)?;

    let storage = Arc::new(StorageClient::new(&storage_url, &storage_key));
    let mut server = ToolServer::new("memory-mcp", env!("CARGO_PKG_VERSION"));
    register_memory_tools(&mut server, storage, user_id);

    server.serve_stdio().await?;
    eprintln!("[memory-mcp] stdin closed, exiting");
    Ok(())
}
