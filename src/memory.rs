//! Memory types and the handlers behind the `memory-mcp` tool server.
//!
//! Persistent-tier entries are injected into every turn's system
//! instructions; session-tier entries are only reachable through the
//! search tool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::storage::StorageClient;
use crate::toolserver::{ToolHandler, ToolServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    /// Always injected into system instructions.
    Persistent,
    /// Recallable on demand, never auto-injected.
    Session,
}

/// A stored memory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub user_id: String,
    pub content: String,
    pub tier: MemoryTier,
    pub importance: i32,
    pub created_at: DateTime<Utc>,
}

/// A memory about to be stored.
#[derive(Debug, Clone, Serialize)]
pub struct NewMemory {
    pub user_id: String,
    pub content: String,
    pub tier: MemoryTier,
    pub importance: i32,
}

/// Register the memory toolset on a server. One registration covers the
/// whole catalog the `memory-mcp` binary exposes.
pub fn register_memory_tools(server: &mut ToolServer, storage: Arc<StorageClient>, user_id: String) {
    server.register(Arc::new(SaveMemory {
        storage: Arc::clone(&storage),
        user_id: user_id.clone(),
    }));
    server.register(Arc::new(SearchMemory {
        storage: Arc::clone(&storage),
        user_id: user_id.clone(),
    }));
    server.register(Arc::new(ListMemory { storage, user_id }));
}

struct SaveMemory {
    storage: Arc<StorageClient>,
    user_id: String,
}

#[async_trait]
impl ToolHandler for SaveMemory {
    fn name(&self) -> &str {
        "memory_save"
    }

    fn description(&self) -> &str {
        "Save a fact or preference about the user. Persistent memories are included in every future conversation."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The fact to remember, phrased in one sentence"
                },
                "tier": {
                    "type": "string",
                    "enum": ["persistent", "session"],
                    "description": "persistent: always injected; session: recall on demand (default)"
                },
                "importance": {
                    "type": "integer",
                    "description": "1-10; higher entries are listed first (default: 5)"
                }
            },
            "required": ["content"]
        })
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing 'content' argument"))?;
        let tier = match args.get("tier").and_then(|v| v.as_str()) {
            Some("persistent") => MemoryTier::Persistent,
            _ => MemoryTier::Session,
        };
        let importance = args
            .get("importance")
            .and_then(|v| v.as_i64())
            .unwrap_or(5)
            .clamp(1, 10) as i32;

        let entry = self
            .storage
            .save_memory(&NewMemory {
                user_id: self.user_id.clone(),
                content: content.trim().to_string(),
                tier,
                importance,
            })
            .await?;

        Ok(json!({ "saved": true, "id": entry.id }))
    }
}

struct SearchMemory {
    storage: Arc<StorageClient>,
    user_id: String,
}

#[async_trait]
impl ToolHandler for SearchMemory {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search stored memories about the user by keyword."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Keyword or phrase to search for"
                }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'query' argument"))?;
        let entries = self.storage.search_memories(&self.user_id, query).await?;
        Ok(render_entries(&entries))
    }
}

struct ListMemory {
    storage: Arc<StorageClient>,
    user_id: String,
}

#[async_trait]
impl ToolHandler for ListMemory {
    fn name(&self) -> &str {
        "memory_list"
    }

    fn description(&self) -> &str {
        "List the persistent memories currently stored about the user."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, _args: Value) -> anyhow::Result<Value> {
        let entries = self.storage.list_persistent_memories(&self.user_id).await?;
        Ok(render_entries(&entries))
    }
}

fn render_entries(entries: &[MemoryEntry]) -> Value {
    if entries.is_empty() {
        return Value::String("No memories stored.".to_string());
    }
    let lines: Vec<String> = entries
        .iter()
        .map(|e| format!("- [{}] {}", e.importance, e.content))
        .collect();
    Value::String(lines.join("\n"))
}
